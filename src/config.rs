use std::{
    fs,
    path::{Path, PathBuf},
};

use log::info;
use machine_learning::optimization::{Adam, GradientDescent, GradientDescentWithMomentum, Optimizer};
use serde::Deserialize;

use crate::{
    QuakeErr, Result,
    model::{Backbone, BackboneWeights, ModelConfig},
    target::Target,
};

/// A training or evaluation run, read from a JSON file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub model: ModelSection,
    pub data: DataConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSection {
    pub backbone: Backbone,
    #[serde(default)]
    pub use_auxiliary_parameters: bool,
    /// A safetensors file with torchvision names to start the backbone from.
    #[serde(default)]
    pub pretrained: Option<PathBuf>,
}

impl ModelSection {
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            backbone: self.backbone,
            use_auxiliary_parameters: self.use_auxiliary_parameters,
        }
    }

    pub fn backbone_weights(&self) -> BackboneWeights {
        match &self.pretrained {
            Some(path) => BackboneWeights::Pretrained(path.clone()),
            None => BackboneWeights::Random,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    /// The CSV with the ground truth of every image.
    pub reference: PathBuf,
    pub train_dir: PathBuf,
    pub val_dir: PathBuf,
    #[serde(default)]
    pub test_dir: Option<PathBuf>,
    pub target: Target,
    /// The quantities fed next to each image when the model uses auxiliary parameters.
    #[serde(default)]
    pub auxiliary: Vec<Target>,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub optimizer: OptimizerConfig,
    pub seed: u64,
    pub shuffle: bool,
    /// The size of the thread pool used by the layers, all cores if unset.
    pub threads: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 10,
            optimizer: OptimizerConfig::default(),
            seed: 0,
            shuffle: true,
            threads: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum OptimizerConfig {
    Adam {
        #[serde(default = "default_lr")]
        lr: f32,
        #[serde(default = "default_b1")]
        b1: f32,
        #[serde(default = "default_b2")]
        b2: f32,
        #[serde(default = "default_eps")]
        eps: f32,
    },
    GradientDescent {
        lr: f32,
    },
    GradientDescentWithMomentum {
        lr: f32,
        mu: f32,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adam {
            lr: default_lr(),
            b1: default_b1(),
            b2: default_b2(),
            eps: default_eps(),
        }
    }
}

impl OptimizerConfig {
    fn lr(&self) -> f32 {
        match *self {
            Self::Adam { lr, .. }
            | Self::GradientDescent { lr }
            | Self::GradientDescentWithMomentum { lr, .. } => lr,
        }
    }

    /// Builds the optimizer for a model with `len` parameters.
    pub fn build(self, len: usize) -> Box<dyn Optimizer> {
        match self {
            Self::Adam { lr, b1, b2, eps } => Box::new(Adam::new(len, lr, b1, b2, eps)),
            Self::GradientDescent { lr } => Box::new(GradientDescent::new(lr)),
            Self::GradientDescentWithMomentum { lr, mu } => {
                Box::new(GradientDescentWithMomentum::new(len, lr, mu))
            }
        }
    }
}

fn default_image_size() -> u32 {
    224
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_lr() -> f32 {
    1e-3
}

fn default_b1() -> f32 {
    0.9
}

fn default_b2() -> f32 {
    0.999
}

fn default_eps() -> f32 {
    1e-8
}

impl RunConfig {
    /// Reads and validates a run file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = Self::from_json(&fs::read_to_string(path)?)?;

        info!(
            epochs = config.training.epochs,
            batch_size = config.training.batch_size;
            "loaded {} run config for {} from {}",
            config.model.backbone,
            config.data.target,
            path.display()
        );
        Ok(config)
    }

    /// Parses and validates a run from its JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// The auxiliary quantities the model is fed, none if it doesn't use them.
    pub fn auxiliary(&self) -> &[Target] {
        if self.model.use_auxiliary_parameters {
            &self.data.auxiliary
        } else {
            &[]
        }
    }

    /// Checks the settings that would otherwise fail in the middle of a run.
    ///
    /// # Errors
    /// `QuakeErr::InvalidConfig` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(QuakeErr::InvalidConfig(msg));

        let training = &self.training;
        if training.batch_size == 0 {
            return invalid("batch_size must be positive".into());
        }
        if training.epochs == 0 {
            return invalid("epochs must be positive".into());
        }
        if training.optimizer.lr() <= 0. {
            return invalid("the learning rate must be positive".into());
        }
        if training.threads == Some(0) {
            return invalid("threads must be positive".into());
        }
        if self.data.image_size == 0 {
            return invalid("image_size must be positive".into());
        }

        if self.model.pretrained.is_some() && !self.model.backbone.has_pretrained() {
            return invalid(format!(
                "{} has no pretrained weights, remove `pretrained`",
                self.model.backbone
            ));
        }

        if self.model.use_auxiliary_parameters {
            let auxiliary = &self.data.auxiliary;
            if !matches!(auxiliary.len(), 2 | 3) {
                return invalid(format!(
                    "auxiliary must list 2 or 3 targets, got {}",
                    auxiliary.len()
                ));
            }
            if auxiliary.contains(&self.data.target) {
                return invalid(format!(
                    "the predicted target {} can't be an auxiliary parameter",
                    self.data.target
                ));
            }
            if auxiliary
                .iter()
                .enumerate()
                .any(|(i, t)| auxiliary[..i].contains(t))
            {
                return invalid("auxiliary targets must be distinct".into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "model": { "backbone": "resnet18" },
        "data": {
            "reference": "Earthquake.csv",
            "train_dir": "train",
            "val_dir": "val",
            "target": "mag"
        }
    }"#;

    fn with(model: &str, data_extra: &str, training: &str) -> String {
        format!(
            r#"{{
                "model": {model},
                "data": {{
                    "reference": "Earthquake.csv",
                    "train_dir": "train",
                    "val_dir": "val",
                    "target": "mag"{data_extra}
                }},
                "training": {training}
            }}"#
        )
    }

    #[test]
    fn minimal_config_takes_defaults() {
        let config = RunConfig::from_json(MINIMAL).unwrap();

        assert_eq!(config.model.backbone, Backbone::ResNet18);
        assert!(!config.model.use_auxiliary_parameters);
        assert_eq!(config.model.backbone_weights(), BackboneWeights::Random);
        assert_eq!(config.data.image_size, 224);
        assert_eq!(config.data.test_dir, None);
        assert_eq!(config.training, TrainingConfig::default());
        assert!(config.auxiliary().is_empty());
    }

    #[test]
    fn optimizers_are_tagged() {
        let json = with(
            r#"{ "backbone": "efficientnet_b0" }"#,
            "",
            r#"{ "optimizer": { "type": "gradient_descent_with_momentum", "lr": 0.01, "mu": 0.9 } }"#,
        );
        let config = RunConfig::from_json(&json).unwrap();

        assert_eq!(
            config.training.optimizer,
            OptimizerConfig::GradientDescentWithMomentum { lr: 0.01, mu: 0.9 }
        );
        assert_eq!(config.training.batch_size, 32);
    }

    #[test]
    fn unknown_backbones_are_rejected() {
        let json = MINIMAL.replace("resnet18", "vgg16");
        let err = RunConfig::from_json(&json).unwrap_err();

        assert!(matches!(err, QuakeErr::Json(_)));
        assert!(err.to_string().contains("unsupported backbone: vgg16"));
    }

    #[test]
    fn auxiliary_parameters_are_checked_when_enabled() {
        let model = r#"{ "backbone": "simple_cnn", "use_auxiliary_parameters": true }"#;

        for auxiliary in [r#"["lon"]"#, r#"["lon", "mag"]"#, r#"["lon", "lon"]"#] {
            let json = with(model, &format!(r#", "auxiliary": {auxiliary}"#), "{}");
            assert!(matches!(
                RunConfig::from_json(&json),
                Err(QuakeErr::InvalidConfig(_))
            ));
        }

        let json = with(model, r#", "auxiliary": ["lon", "lat", "dep"]"#, "{}");
        let config = RunConfig::from_json(&json).unwrap();
        assert_eq!(config.auxiliary(), [Target::Lon, Target::Lat, Target::Dep]);
    }

    #[test]
    fn pretrained_simple_cnn_is_rejected() {
        let json = with(
            r#"{ "backbone": "simple_cnn", "pretrained": "weights.safetensors" }"#,
            "",
            "{}",
        );
        assert!(matches!(
            RunConfig::from_json(&json),
            Err(QuakeErr::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for training in [r#"{ "batch_size": 0 }"#, r#"{ "epochs": 0 }"#] {
            let json = with(r#"{ "backbone": "resnet18" }"#, "", training);
            assert!(RunConfig::from_json(&json).is_err());
        }
    }
}
