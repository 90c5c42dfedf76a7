use std::{
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
};

use machine_learning::{
    Result as MlResult,
    arch::{Mode, Module},
    params::{BackIter, FrontIter, FrontIterMut},
    weights::WeightMap,
};
use ndarray::{Array2, Array4};
use rand::Rng;
use serde::Deserialize;

use super::{EfficientNetB0, ResNet18, SimpleCnn};
use crate::error::QuakeErr;

/// The image feature extractors a model can be built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Backbone {
    ResNet18,
    EfficientNetB0,
    SimpleCnn,
}

impl Backbone {
    pub const ALL: [Backbone; 3] = [Backbone::ResNet18, Backbone::EfficientNetB0, Backbone::SimpleCnn];

    pub fn name(self) -> &'static str {
        match self {
            Self::ResNet18 => "resnet18",
            Self::EfficientNetB0 => "efficientnet_b0",
            Self::SimpleCnn => "simple_cnn",
        }
    }

    /// The width of the feature vector the backbone outputs per image.
    pub fn feature_dim(self) -> usize {
        match self {
            Self::ResNet18 => 512,
            Self::EfficientNetB0 => 1280,
            Self::SimpleCnn => 64,
        }
    }

    /// Whether the backbone has a published pretrained counterpart to load.
    pub fn has_pretrained(self) -> bool {
        !matches!(self, Self::SimpleCnn)
    }
}

impl Display for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backbone {
    type Err = QuakeErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|backbone| backbone.name() == s)
            .ok_or_else(|| QuakeErr::UnsupportedBackbone(s.to_string()))
    }
}

impl TryFrom<String> for Backbone {
    type Error = QuakeErr;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Where the backbone's initial weights come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackboneWeights {
    /// A safetensors file with the torchvision tensor names.
    Pretrained(PathBuf),
    Random,
}

/// A built backbone, mapping `(N, 3, H, W)` images to `(N, feature_dim)` features.
#[derive(Debug, Clone)]
pub enum FeatureExtractor {
    ResNet18(ResNet18),
    EfficientNetB0(EfficientNetB0),
    SimpleCnn(SimpleCnn),
}

impl FeatureExtractor {
    /// Builds the layers of `backbone`.
    ///
    /// # Arguments
    /// * `backbone` - The architecture to build.
    /// * `seed` - Seeds the stochastic depth of the architectures that use it.
    pub fn new(backbone: Backbone, seed: u64) -> Self {
        match backbone {
            Backbone::ResNet18 => Self::ResNet18(ResNet18::new()),
            Backbone::EfficientNetB0 => Self::EfficientNetB0(EfficientNetB0::new(seed)),
            Backbone::SimpleCnn => Self::SimpleCnn(SimpleCnn::new()),
        }
    }

    pub fn backbone(&self) -> Backbone {
        match self {
            Self::ResNet18(_) => Backbone::ResNet18,
            Self::EfficientNetB0(_) => Backbone::EfficientNetB0,
            Self::SimpleCnn(_) => Backbone::SimpleCnn,
        }
    }

    pub fn feature_dim(&self) -> usize {
        self.backbone().feature_dim()
    }
}

macro_rules! dispatch {
    ($self:expr, $b:ident => $body:expr) => {
        match $self {
            FeatureExtractor::ResNet18($b) => $body,
            FeatureExtractor::EfficientNetB0($b) => $body,
            FeatureExtractor::SimpleCnn($b) => $body,
        }
    };
}

impl Module for FeatureExtractor {
    type Input = Array4<f32>;
    type Output = Array2<f32>;

    fn size(&self) -> usize {
        dispatch!(self, b => b.size())
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> MlResult<()> {
        dispatch!(self, b => b.init(params, rng))
    }

    fn forward(&mut self, params: &mut FrontIter, x: Array4<f32>, mode: Mode) -> MlResult<Array2<f32>> {
        dispatch!(self, b => b.forward(params, x, mode))
    }

    fn backward(&mut self, params: &mut BackIter, d: Array2<f32>) -> MlResult<Array4<f32>> {
        dispatch!(self, b => b.backward(params, d))
    }

    fn load(&mut self, params: &mut FrontIterMut, weights: &WeightMap, prefix: &str) -> MlResult<()> {
        dispatch!(self, b => b.load(params, weights, prefix))
    }

    fn buffer_size(&self) -> usize {
        dispatch!(self, b => b.buffer_size())
    }

    fn export_buffers(&self, out: &mut Vec<f32>) {
        dispatch!(self, b => b.export_buffers(out))
    }

    fn import_buffers(&mut self, src: &mut &[f32]) -> MlResult<()> {
        dispatch!(self, b => b.import_buffers(src))
    }
}
