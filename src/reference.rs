use std::{collections::HashMap, fs::File, io::Read, path::Path};

use log::info;
use serde::Deserialize;

use crate::{QuakeErr, Result, target::Target};

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Mag")]
    mag: f64,
    #[serde(rename = "Lon")]
    lon: f64,
    #[serde(rename = "Lat")]
    lat: f64,
    #[serde(rename = "Depth")]
    depth: f64,
}

/// Ground truth values of every target, keyed by image identifier.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    mag: HashMap<String, f64>,
    dep: HashMap<String, f64>,
    lon: HashMap<String, f64>,
    lat: HashMap<String, f64>,
}

impl ReferenceTable {
    /// Reads a reference table from a CSV file.
    ///
    /// The file must have a header with at least the `Image`, `Mag`, `Lon`, `Lat` and `Depth`
    /// columns, any other column is ignored.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let table = Self::from_reader(File::open(path)?)?;

        info!(rows = table.len(); "loaded reference table from {}", path.display());
        Ok(table)
    }

    /// Reads a reference table from any CSV source.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut table = Self::default();
        for row in reader.deserialize() {
            let row: Row = row?;
            table.insert(row.image, [row.mag, row.depth, row.lon, row.lat]);
        }

        Ok(table)
    }

    /// Inserts the `[mag, dep, lon, lat]` values of `id`, replacing previous ones.
    pub fn insert(&mut self, id: String, [mag, dep, lon, lat]: [f64; 4]) {
        self.mag.insert(id.clone(), mag);
        self.dep.insert(id.clone(), dep);
        self.lon.insert(id.clone(), lon);
        self.lat.insert(id, lat);
    }

    fn column(&self, target: Target) -> &HashMap<String, f64> {
        match target {
            Target::Mag => &self.mag,
            Target::Dep => &self.dep,
            Target::Lon => &self.lon,
            Target::Lat => &self.lat,
        }
    }

    /// Returns the ground truth `target` value of `id`.
    ///
    /// # Errors
    /// `QuakeErr::MissingReference` if there's no row for `id`.
    pub fn get(&self, target: Target, id: &str) -> Result<f64> {
        self.column(target)
            .get(id)
            .copied()
            .ok_or_else(|| QuakeErr::MissingReference {
                id: id.to_string(),
                target,
            })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.mag.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.mag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mag.is_empty()
    }
}
