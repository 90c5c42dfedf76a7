use rand::Rng;

use super::Mode;
use crate::{
    Result,
    params::{BackIter, FrontIter, FrontIterMut},
    weights::WeightMap,
};

/// A differentiable building block whose trainable parameters live in a shared `ParamStore`.
///
/// Every method that receives a parameter iterator must take exactly `size()` values from
/// it, in the same order in all of them.
pub trait Module {
    type Input;
    type Output;

    /// Returns the amount of trainable parameters of this module.
    fn size(&self) -> usize;

    /// Writes the initial values of this module's parameters.
    ///
    /// # Arguments
    /// * `params` - The parameters iterator, positioned at this module.
    /// * `rng` - The random number generator to sample from.
    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> Result<()>;

    /// Computes the output of this module, caching what the backward pass needs.
    ///
    /// # Arguments
    /// * `params` - The parameters iterator, positioned at this module.
    /// * `x` - The input.
    /// * `mode` - Whether the pass is part of training.
    fn forward(&mut self, params: &mut FrontIter, x: Self::Input, mode: Mode)
    -> Result<Self::Output>;

    /// Accumulates the gradient of this module's parameters and returns the gradient with
    /// respect to the last forward input.
    ///
    /// # Arguments
    /// * `params` - The reversed parameters iterator, positioned at the end of this module.
    /// * `d` - The gradient with respect to the last forward output.
    fn backward(&mut self, params: &mut BackIter, d: Self::Output) -> Result<Self::Input>;

    /// Copies pretrained values for this module from `weights`.
    ///
    /// # Arguments
    /// * `params` - The parameters iterator, positioned at this module.
    /// * `weights` - The named pretrained tensors.
    /// * `prefix` - The name of this module inside `weights`.
    ///
    /// Modules without pretrained counterparts keep their current values.
    fn load(&mut self, params: &mut FrontIterMut, _weights: &WeightMap, _prefix: &str)
    -> Result<()> {
        params.take(self.size())?;
        Ok(())
    }

    /// Returns the amount of non trainable state values (e.g. running statistics).
    fn buffer_size(&self) -> usize {
        0
    }

    /// Appends the non trainable state of this module to `out`.
    fn export_buffers(&self, _out: &mut Vec<f32>) {}

    /// Restores the non trainable state of this module, advancing `src`.
    fn import_buffers(&mut self, _src: &mut &[f32]) -> Result<()> {
        Ok(())
    }
}

/// Splits the first `n` values off `src`.
pub(crate) fn take_buffer<'a>(src: &mut &'a [f32], n: usize) -> Result<&'a [f32]> {
    if n > src.len() {
        return Err(crate::MlErr::SizeMismatch {
            what: "module buffers",
            got: src.len(),
            expected: n,
        });
    }

    let (head, tail) = src.split_at(n);
    *src = tail;
    Ok(head)
}
