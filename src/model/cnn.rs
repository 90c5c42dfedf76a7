use std::{collections::HashMap, path::Path};

use log::info;
use machine_learning::{
    arch::{Mode, Module, activations::ActFn, layers::Dense},
    optimization::Optimizer,
    params::ParamStore,
    weights::{self, WeightMap},
};
use ndarray::{Array1, Array2, Array4, ArrayView1, ArrayView2, Axis, concatenate, s};
use rand::{SeedableRng, rngs::StdRng};
use serde::Deserialize;

use super::{AUX_EMBEDDING, AuxiliaryEncoder, Backbone, BackboneWeights, FeatureExtractor};
use crate::{QuakeErr, Result};

/// The width every backbone embedding is reduced to.
pub const REDUCED_WIDTH: usize = 128;
/// The head's input width when the auxiliary embedding is concatenated.
pub const FUSED_WIDTH: usize = REDUCED_WIDTH + AUX_EMBEDDING;
const HEAD_HIDDEN: usize = 64;

const BACKBONE_KEY: &str = "backbone";
const AUXILIARY_KEY: &str = "use_auxiliary_parameters";

/// The architecture choices of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ModelConfig {
    pub backbone: Backbone,
    #[serde(default)]
    pub use_auxiliary_parameters: bool,
}

/// The full regression network: a backbone, a reduction to `REDUCED_WIDTH` features, an
/// optional auxiliary encoder whose embedding is concatenated to them, and a two layer head
/// predicting one value per image.
///
/// The model owns its parameters, laid out as backbone, reduction, auxiliary encoder and
/// head.
#[derive(Debug)]
pub struct Cnn {
    config: ModelConfig,
    backbone: FeatureExtractor,
    reduce: Dense,
    aux: Option<AuxiliaryEncoder>,
    fc1: Dense,
    fc2: Dense,
    store: ParamStore,
}

impl Cnn {
    /// Creates a new `Cnn`.
    ///
    /// # Arguments
    /// * `config` - The architecture.
    /// * `weights` - Where the backbone's initial weights come from.
    /// * `seed` - Seeds the parameter initialization and the stochastic depth.
    ///
    /// # Errors
    /// `QuakeErr::InvalidConfig` if pretrained weights are requested for a backbone without
    /// a pretrained counterpart, or any error reading them.
    pub fn new(config: ModelConfig, weights: BackboneWeights, seed: u64) -> Result<Self> {
        if matches!(weights, BackboneWeights::Pretrained(_)) && !config.backbone.has_pretrained() {
            return Err(QuakeErr::InvalidConfig(format!(
                "{} is always trained from scratch, it can't load pretrained weights",
                config.backbone
            )));
        }

        let backbone = FeatureExtractor::new(config.backbone, seed);
        let reduce = Dense::new((backbone.feature_dim(), REDUCED_WIDTH), Some(ActFn::relu()));
        let aux = config.use_auxiliary_parameters.then(AuxiliaryEncoder::new);
        let fused = if aux.is_some() { FUSED_WIDTH } else { REDUCED_WIDTH };
        let fc1 = Dense::new((fused, HEAD_HIDDEN), Some(ActFn::relu()));
        let fc2 = Dense::new((HEAD_HIDDEN, 1), None);

        let size = backbone.size()
            + reduce.size()
            + aux.as_ref().map_or(0, |aux| aux.size())
            + fc1.size()
            + fc2.size();

        let mut store = ParamStore::zeros(size);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = store.front_mut();
        backbone.init(&mut params, &mut rng)?;
        reduce.init(&mut params, &mut rng)?;
        if let Some(aux) = &aux {
            aux.init(&mut params, &mut rng)?;
        }
        fc1.init(&mut params, &mut rng)?;
        fc2.init(&mut params, &mut rng)?;

        let mut model = Self {
            config,
            backbone,
            reduce,
            aux,
            fc1,
            fc2,
            store,
        };

        if let BackboneWeights::Pretrained(path) = weights {
            model.load_backbone(&path)?;
        }

        info!(
            params = model.num_params(),
            auxiliary = config.use_auxiliary_parameters;
            "built {} model", config.backbone
        );
        Ok(model)
    }

    fn load_backbone(&mut self, path: &Path) -> Result<()> {
        let weights = WeightMap::from_file(path)?;
        self.backbone.load(&mut self.store.front_mut(), &weights, "")?;

        info!(tensors = weights.len(); "loaded pretrained backbone from {}", path.display());
        Ok(())
    }

    /// Predicts one value per image.
    ///
    /// # Arguments
    /// * `images` - A `(N, 3, H, W)` batch.
    /// * `aux` - The `(N, 2)` or `(N, 3)` auxiliary parameters, ignored if the model doesn't
    ///   use them.
    /// * `mode` - Whether the pass is part of training.
    ///
    /// # Errors
    /// `QuakeErr::MissingAuxiliary`, `QuakeErr::AuxiliaryWidth` or `QuakeErr::BatchMismatch`
    /// when the auxiliary parameters don't fit the model or the batch.
    pub fn forward(
        &mut self,
        images: Array4<f32>,
        aux: Option<ArrayView2<f32>>,
        mode: Mode,
    ) -> Result<Array1<f32>> {
        let n = images.dim().0;

        let aux = match (&self.aux, aux) {
            (Some(_), None) => return Err(QuakeErr::MissingAuxiliary),
            (Some(_), Some(aux)) if !matches!(aux.ncols(), 2 | 3) => {
                return Err(QuakeErr::AuxiliaryWidth { got: aux.ncols() });
            }
            (Some(_), Some(aux)) if aux.nrows() != n => {
                return Err(QuakeErr::BatchMismatch {
                    what: "auxiliary parameters",
                    got: aux.nrows(),
                    expected: n,
                });
            }
            (Some(_), Some(aux)) => Some(aux.to_owned()),
            (None, _) => None,
        };

        let mut params = self.store.front();
        let features = self.backbone.forward(&mut params, images, mode)?;
        let mut h = self.reduce.forward(&mut params, features, mode)?;

        if let (Some(encoder), Some(aux)) = (&mut self.aux, aux) {
            let embedding = encoder.forward(&mut params, aux, mode)?;
            h = concatenate(Axis(1), &[h.view(), embedding.view()])?;
        }

        h = self.fc1.forward(&mut params, h, mode)?;
        let y = self.fc2.forward(&mut params, h, mode)?;

        Ok(y.column(0).to_owned())
    }

    /// Accumulates the gradient of every parameter for the last forward pass.
    ///
    /// # Arguments
    /// * `d` - The gradient with respect to each prediction.
    pub fn backward(&mut self, d: ArrayView1<f32>) -> Result<()> {
        let mut params = self.store.back();

        let d = d.to_owned().insert_axis(Axis(1));
        let d = self.fc2.backward(&mut params, d)?;
        let mut d = self.fc1.backward(&mut params, d)?;

        if let Some(encoder) = &mut self.aux {
            let d_aux = d.slice(s![.., REDUCED_WIDTH..]).to_owned();
            encoder.backward(&mut params, d_aux)?;
            d = d.slice(s![.., ..REDUCED_WIDTH]).to_owned();
        }

        let d = self.reduce.backward(&mut params, d)?;
        self.backbone.backward(&mut params, d)?;
        Ok(())
    }

    /// Applies one optimization step with the accumulated gradient.
    pub fn step<O: Optimizer + ?Sized>(&mut self, optimizer: &mut O) -> Result<()> {
        self.store.optimize(optimizer)?;
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.store.zero_grad();
    }

    /// Returns the backbone features of `images`, before the reduction.
    pub fn embed(&mut self, images: Array4<f32>, mode: Mode) -> Result<Array2<f32>> {
        let mut params = self.store.front();
        Ok(self.backbone.forward(&mut params, images, mode)?)
    }

    pub fn config(&self) -> ModelConfig {
        self.config
    }

    pub fn feature_dim(&self) -> usize {
        self.backbone.feature_dim()
    }

    pub fn num_params(&self) -> usize {
        self.store.len()
    }

    pub fn params(&self) -> &[f32] {
        self.store.params()
    }

    pub fn grad(&self) -> &[f32] {
        self.store.grad()
    }

    /// The batch normalization running statistics of the backbone.
    pub fn buffers(&self) -> Vec<f32> {
        let mut buffers = Vec::with_capacity(self.backbone.buffer_size());
        self.backbone.export_buffers(&mut buffers);
        buffers
    }

    /// Writes the parameters, the running statistics and the architecture to a safetensors
    /// file.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let buffers = self.buffers();

        let mut tensors = vec![("params", vec![self.store.len()], self.store.params())];
        if !buffers.is_empty() {
            tensors.push(("buffers", vec![buffers.len()], &buffers[..]));
        }

        let metadata = HashMap::from([
            (BACKBONE_KEY.to_string(), self.config.backbone.to_string()),
            (
                AUXILIARY_KEY.to_string(),
                self.config.use_auxiliary_parameters.to_string(),
            ),
        ]);

        weights::save_tensors(path, &tensors, metadata)?;
        info!(params = self.num_params(); "saved checkpoint to {}", path.display());
        Ok(())
    }

    /// Restores a checkpoint written by `save_checkpoint`.
    ///
    /// # Errors
    /// `QuakeErr::Checkpoint` if it was written by a model with another architecture.
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let weights = WeightMap::from_file(path)?;

        let expect = |key: &str, expected: String| match weights.metadata().get(key) {
            Some(value) if *value == expected => Ok(()),
            Some(value) => Err(QuakeErr::Checkpoint(format!(
                "{key} is {value}, expected {expected}"
            ))),
            None => Err(QuakeErr::Checkpoint(format!("missing {key}"))),
        };
        expect(BACKBONE_KEY, self.config.backbone.to_string())?;
        expect(AUXILIARY_KEY, self.config.use_auxiliary_parameters.to_string())?;

        let (_, params) = weights.get("params")?;
        if params.len() != self.store.len() {
            return Err(QuakeErr::Checkpoint(format!(
                "{} parameters, expected {}",
                params.len(),
                self.store.len()
            )));
        }

        let buffer_size = self.backbone.buffer_size();
        let buffers = if buffer_size == 0 {
            &[][..]
        } else {
            weights.get("buffers")?.1
        };
        if buffers.len() != buffer_size {
            return Err(QuakeErr::Checkpoint(format!(
                "{} buffer values, expected {buffer_size}",
                buffers.len()
            )));
        }

        self.store.set_params(params)?;
        self.backbone.import_buffers(&mut &buffers[..])?;

        info!(params = params.len(); "loaded checkpoint from {}", path.display());
        Ok(())
    }
}
