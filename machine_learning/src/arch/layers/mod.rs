mod activation;
mod batch_norm;
mod conv;
mod dense;
mod layer;
mod pool;
mod sequential;

#[cfg(test)]
pub(crate) mod gradcheck;

pub use activation::Activation;
pub use batch_norm::BatchNorm2d;
pub use conv::Conv2d;
pub use dense::Dense;
pub use layer::Layer;
pub use pool::{GlobalAvgPool, MaxPool2d};
pub use sequential::Sequential;
