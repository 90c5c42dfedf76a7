use ndarray::Array4;
use rand::Rng;

use crate::{
    MlErr, Result,
    arch::{Mode, Module, activations::ActFn},
    params::{BackIter, FrontIter, FrontIterMut},
};

/// Applies an activation function elementwise over `(N, C, H, W)` batches.
#[derive(Debug, Clone)]
pub struct Activation {
    act_fn: ActFn,

    // Forward metadata
    z: Option<Array4<f32>>,
}

impl Activation {
    pub fn new(act_fn: ActFn) -> Self {
        Self { act_fn, z: None }
    }

    pub fn relu() -> Self {
        Self::new(ActFn::relu())
    }

    pub fn silu() -> Self {
        Self::new(ActFn::silu())
    }

    pub fn sigmoid() -> Self {
        Self::new(ActFn::sigmoid(1.))
    }
}

impl Module for Activation {
    type Input = Array4<f32>;
    type Output = Array4<f32>;

    fn size(&self) -> usize {
        0
    }

    fn init<R: Rng>(&self, _params: &mut FrontIterMut, _rng: &mut R) -> Result<()> {
        Ok(())
    }

    fn forward(&mut self, _params: &mut FrontIter, x: Array4<f32>, _mode: Mode) -> Result<Array4<f32>> {
        let a = x.mapv(|z| self.act_fn.f(z));
        self.z = Some(x);
        Ok(a)
    }

    fn backward(&mut self, _params: &mut BackIter, mut d: Array4<f32>) -> Result<Array4<f32>> {
        let z = self.z.take().ok_or(MlErr::NotForwarded("activation"))?;
        d.zip_mut_with(&z, |d, &z| *d *= self.act_fn.df(z));
        Ok(d)
    }
}
