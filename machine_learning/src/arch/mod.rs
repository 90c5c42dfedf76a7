pub mod activations;
pub mod layers;
pub mod loss;
pub mod metrics;
mod module;

pub use module::Module;

/// Whether a forward pass is part of training or of evaluation.
///
/// Batch normalization uses the batch statistics and stochastic depth drops residual
/// branches only in `Mode::Train`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}
