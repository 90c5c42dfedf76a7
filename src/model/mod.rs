mod auxiliary;
mod backbone;
mod cnn;
mod efficientnet;
mod resnet;
mod simple_cnn;

pub use auxiliary::{AUX_EMBEDDING, AuxiliaryEncoder};
pub use backbone::{Backbone, BackboneWeights, FeatureExtractor};
pub use cnn::{Cnn, FUSED_WIDTH, ModelConfig, REDUCED_WIDTH};
pub use efficientnet::EfficientNetB0;
pub use resnet::ResNet18;
pub use simple_cnn::SimpleCnn;

/// Joins a module name to its parent's, pretrained tensor names have no leading separator.
pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
