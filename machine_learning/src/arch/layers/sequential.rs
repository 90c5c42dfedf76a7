use ndarray::Array4;
use rand::Rng;

use super::Layer;
use crate::{
    Result,
    arch::{Mode, Module},
    params::{BackIter, FrontIter, FrontIterMut},
    weights::WeightMap,
};

/// A sequential model: information flows forward when computing an output and backward when
/// computing the *deltas* of its layers.
///
/// When loading, the layer at position `i` is looked up as `{prefix}.{i}`.
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    layers: Vec<Layer>,
}

impl Sequential {
    /// Creates a new `Sequential`.
    ///
    /// # Arguments
    /// * `layers` - The layers the sequential is composed of.
    ///
    /// # Returns
    /// A new `Sequential` instance.
    pub fn new<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Layer>,
    {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    type Input = Array4<f32>;
    type Output = Array4<f32>;

    fn size(&self) -> usize {
        self.layers.iter().map(|layer| layer.size()).sum()
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> Result<()> {
        for layer in &self.layers {
            layer.init(params, rng)?;
        }

        Ok(())
    }

    fn forward(&mut self, params: &mut FrontIter, mut x: Array4<f32>, mode: Mode) -> Result<Array4<f32>> {
        for layer in self.layers.iter_mut() {
            x = layer.forward(params, x, mode)?;
        }

        Ok(x)
    }

    fn backward(&mut self, params: &mut BackIter, mut d: Array4<f32>) -> Result<Array4<f32>> {
        for layer in self.layers.iter_mut().rev() {
            d = layer.backward(params, d)?;
        }

        Ok(d)
    }

    fn load(&mut self, params: &mut FrontIterMut, weights: &WeightMap, prefix: &str) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.load(params, weights, &format!("{prefix}.{i}"))?;
        }

        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.layers.iter().map(|layer| layer.buffer_size()).sum()
    }

    fn export_buffers(&self, out: &mut Vec<f32>) {
        for layer in &self.layers {
            layer.export_buffers(out);
        }
    }

    fn import_buffers(&mut self, src: &mut &[f32]) -> Result<()> {
        for layer in self.layers.iter_mut() {
            layer.import_buffers(src)?;
        }

        Ok(())
    }
}
