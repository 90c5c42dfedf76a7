use ndarray::Array4;
use rand::Rng;

use super::{Activation, BatchNorm2d, Conv2d, MaxPool2d};
use crate::{
    Result,
    arch::{Mode, Module},
    params::{BackIter, FrontIter, FrontIterMut},
    weights::WeightMap,
};

/// Any of the layers that map `(N, C, H, W)` batches to `(N, C, H, W)` batches.
#[derive(Debug, Clone)]
pub enum Layer {
    Conv(Conv2d),
    BatchNorm(BatchNorm2d),
    Act(Activation),
    MaxPool(MaxPool2d),
}

impl From<Conv2d> for Layer {
    fn from(value: Conv2d) -> Self {
        Self::Conv(value)
    }
}

impl From<BatchNorm2d> for Layer {
    fn from(value: BatchNorm2d) -> Self {
        Self::BatchNorm(value)
    }
}

impl From<Activation> for Layer {
    fn from(value: Activation) -> Self {
        Self::Act(value)
    }
}

impl From<MaxPool2d> for Layer {
    fn from(value: MaxPool2d) -> Self {
        Self::MaxPool(value)
    }
}

macro_rules! dispatch {
    ($self:expr, $l:ident => $body:expr) => {
        match $self {
            Layer::Conv($l) => $body,
            Layer::BatchNorm($l) => $body,
            Layer::Act($l) => $body,
            Layer::MaxPool($l) => $body,
        }
    };
}

impl Module for Layer {
    type Input = Array4<f32>;
    type Output = Array4<f32>;

    fn size(&self) -> usize {
        dispatch!(self, l => l.size())
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> Result<()> {
        dispatch!(self, l => l.init(params, rng))
    }

    fn forward(&mut self, params: &mut FrontIter, x: Array4<f32>, mode: Mode) -> Result<Array4<f32>> {
        dispatch!(self, l => l.forward(params, x, mode))
    }

    fn backward(&mut self, params: &mut BackIter, d: Array4<f32>) -> Result<Array4<f32>> {
        dispatch!(self, l => l.backward(params, d))
    }

    fn load(&mut self, params: &mut FrontIterMut, weights: &WeightMap, prefix: &str) -> Result<()> {
        dispatch!(self, l => l.load(params, weights, prefix))
    }

    fn buffer_size(&self) -> usize {
        dispatch!(self, l => l.buffer_size())
    }

    fn export_buffers(&self, out: &mut Vec<f32>) {
        dispatch!(self, l => l.export_buffers(out))
    }

    fn import_buffers(&mut self, src: &mut &[f32]) -> Result<()> {
        dispatch!(self, l => l.import_buffers(src))
    }
}
