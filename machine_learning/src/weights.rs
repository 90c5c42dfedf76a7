use std::{collections::HashMap, fs, path::Path};

use log::debug;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{MlErr, Result};

#[derive(Debug)]
struct Entry {
    shape: Vec<usize>,
    dtype: Dtype,
    data: Vec<f32>,
}

/// A set of named tensors read from a safetensors file.
///
/// Every `F32` tensor is decoded eagerly, tensors of any other dtype are only kept by name
/// and shape so asking for them fails with a descriptive error.
#[derive(Debug, Default)]
pub struct WeightMap {
    tensors: HashMap<String, Entry>,
    metadata: HashMap<String, String>,
}

impl WeightMap {
    /// Reads a safetensors file.
    ///
    /// # Arguments
    /// * `path` - The file's path.
    ///
    /// # Returns
    /// The decoded tensors or an error if the file can't be read or isn't valid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let map = Self::from_bytes(&fs::read(path)?)?;

        debug!(tensors = map.len(); "read {}", path.display());
        Ok(map)
    }

    /// Decodes an in memory safetensors buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let safetensors = SafeTensors::deserialize(bytes)?;
        let mut tensors = HashMap::new();

        for (name, view) in safetensors.tensors() {
            let dtype = view.dtype();
            let data = match dtype {
                Dtype::F32 => view
                    .data()
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
                _ => Vec::new(),
            };

            let entry = Entry {
                shape: view.shape().to_vec(),
                dtype,
                data,
            };

            tensors.insert(name, entry);
        }

        Ok(Self { tensors, metadata })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// The free form string metadata stored in the file's header.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Returns the shape and values of an `F32` tensor.
    pub fn get(&self, name: &str) -> Result<(&[usize], &[f32])> {
        let entry = self
            .tensors
            .get(name)
            .ok_or_else(|| MlErr::MissingTensor(name.to_string()))?;

        if entry.dtype != Dtype::F32 {
            return Err(MlErr::TensorDtype {
                name: name.to_string(),
                got: format!("{:?}", entry.dtype),
            });
        }

        Ok((&entry.shape, &entry.data))
    }

    /// Copies the tensor `name` into `dst` after checking it has the expected `shape`.
    ///
    /// # Errors
    /// * `MlErr::MissingTensor` if there's no tensor named `name`.
    /// * `MlErr::TensorDtype` if it isn't an `F32` tensor.
    /// * `MlErr::TensorShape` if its shape isn't `shape`.
    /// * `MlErr::SizeMismatch` if `dst` can't hold `shape`.
    pub fn copy_into(&self, name: &str, shape: &[usize], dst: &mut [f32]) -> Result<()> {
        let (got, data) = self.get(name)?;

        if got != shape {
            return Err(MlErr::TensorShape {
                name: name.to_string(),
                got: got.to_vec(),
                expected: shape.to_vec(),
            });
        }

        if dst.len() != data.len() {
            return Err(MlErr::SizeMismatch {
                what: "tensor destination",
                got: dst.len(),
                expected: data.len(),
            });
        }

        dst.copy_from_slice(data);
        Ok(())
    }
}

/// Writes `F32` tensors and string metadata to a safetensors file.
///
/// # Arguments
/// * `path` - Where to write the file.
/// * `tensors` - The `(name, shape, values)` of each tensor.
/// * `metadata` - Free form metadata to store in the header.
pub fn save_tensors<P: AsRef<Path>>(
    path: P,
    tensors: &[(&str, Vec<usize>, &[f32])],
    metadata: HashMap<String, String>,
) -> Result<()> {
    let mut views = HashMap::with_capacity(tensors.len());

    for (name, shape, data) in tensors {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(MlErr::SizeMismatch {
                what: "tensor values",
                got: data.len(),
                expected,
            });
        }

        let bytes = bytemuck::cast_slice::<f32, u8>(data);
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)?;
        views.insert(name.to_string(), view);
    }

    safetensors::serialize_to_file(&views, &Some(metadata), path.as_ref())?;
    Ok(())
}
