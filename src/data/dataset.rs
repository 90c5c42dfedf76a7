use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::{Result, reference::ReferenceTable, target::Target};

const EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// An image file with the values looked up for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub path: PathBuf,
    /// The reference table key of the image.
    pub id: String,
    pub label: Option<f32>,
    pub aux: Option<Vec<f32>>,
}

/// The images of a directory joined with the reference table.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    samples: Vec<Sample>,
}

impl ImageSet {
    /// Indexes the images of `dir`, labeling them with their `target` value.
    ///
    /// # Arguments
    /// * `dir` - The directory holding the images.
    /// * `reference` - The ground truth table.
    /// * `target` - The predicted quantity.
    /// * `auxiliary` - The quantities fed to the model next to each image, may be empty.
    ///
    /// # Errors
    /// `QuakeErr::MissingReference` if an image has no row in `reference`.
    pub fn labeled<P: AsRef<Path>>(
        dir: P,
        reference: &ReferenceTable,
        target: Target,
        auxiliary: &[Target],
    ) -> Result<Self> {
        Self::index(dir.as_ref(), reference, Some(target), auxiliary)
    }

    /// Indexes the images of `dir` without labels, their ground truth is looked up when
    /// the predictions are exported.
    pub fn unlabeled<P: AsRef<Path>>(
        dir: P,
        reference: &ReferenceTable,
        auxiliary: &[Target],
    ) -> Result<Self> {
        Self::index(dir.as_ref(), reference, None, auxiliary)
    }

    fn index(
        dir: &Path,
        reference: &ReferenceTable,
        target: Option<Target>,
        auxiliary: &[Target],
    ) -> Result<Self> {
        let mut samples = Vec::new();

        for path in list_images(dir)? {
            let id = identifier(&path, reference);

            let label = match target {
                Some(target) => Some(reference.get(target, &id)? as f32),
                None => None,
            };

            let aux = if auxiliary.is_empty() {
                None
            } else {
                let values = auxiliary
                    .iter()
                    .map(|&t| reference.get(t, &id).map(|v| v as f32))
                    .collect::<Result<Vec<_>>>()?;
                Some(values)
            };

            samples.push(Sample {
                path,
                id,
                label,
                aux,
            });
        }

        info!(images = samples.len(); "indexed {}", dir.display());
        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The supported image files of `dir`, sorted by path.
fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let supported = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));

        if path.is_file() && supported {
            paths.push(path);
        } else {
            debug!("skipping {}", path.display());
        }
    }

    paths.sort();
    Ok(paths)
}

/// The file name of `path`, or its stem when only the stem is a key of `reference`.
fn identifier(path: &Path, reference: &ReferenceTable) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if reference.contains(&name) {
        return name;
    }

    match path.file_stem().map(|stem| stem.to_string_lossy()) {
        Some(stem) if reference.contains(&stem) => stem.into_owned(),
        _ => name,
    }
}
