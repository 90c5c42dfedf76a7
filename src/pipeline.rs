use std::{
    fs,
    path::{Path, PathBuf},
};

use log::info;
use machine_learning::arch::loss::Mse;

use crate::{
    QuakeErr, Result,
    config::RunConfig,
    data::{DataLoader, ImageSet},
    export::TestReport,
    model::{BackboneWeights, Cnn},
    reference::ReferenceTable,
    training,
};

/// The file the best model of a run is kept in, inside the output directory.
pub const BEST_CHECKPOINT: &str = "best.safetensors";

/// The losses of one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    pub val_mae: f32,
}

/// The outcome of a whole training run.
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub epochs: Vec<EpochSummary>,
    /// The epoch with the lowest validation error, whose model was kept.
    pub best_epoch: usize,
    pub checkpoint: PathBuf,
    /// The test export of the best model, if the run has a test directory.
    pub test: Option<TestReport>,
}

/// Trains a model as described by `config`, keeping the one with the lowest validation
/// error, then tests it if a test directory is configured.
pub fn fit(config: &RunConfig) -> Result<FitReport> {
    let reference = ReferenceTable::from_path(&config.data.reference)?;
    let (data, training) = (&config.data, &config.training);

    let train_set = ImageSet::labeled(&data.train_dir, &reference, data.target, config.auxiliary())?;
    let val_set = ImageSet::labeled(&data.val_dir, &reference, data.target, config.auxiliary())?;

    let mut train_loader = DataLoader::new(train_set, training.batch_size, data.image_size);
    if training.shuffle {
        train_loader = train_loader.shuffle(training.seed);
    }
    let mut val_loader = DataLoader::new(val_set, training.batch_size, data.image_size);

    let mut model = Cnn::new(
        config.model.model_config(),
        config.model.backbone_weights(),
        training.seed,
    )?;
    let mut optimizer = training.optimizer.build(model.num_params());

    fs::create_dir_all(&data.output_dir)?;
    let checkpoint = data.output_dir.join(BEST_CHECKPOINT);

    let mut epochs = Vec::with_capacity(training.epochs);
    let mut best: Option<EpochSummary> = None;

    for epoch in 1..=training.epochs {
        let train_loss = training::train(&mut model, train_loader.batches(), &Mse, optimizer.as_mut())?;
        let (val_loss, val_mae) = training::validate(&mut model, val_loader.batches(), &Mse)?;

        let summary = EpochSummary {
            epoch,
            train_loss,
            val_loss,
            val_mae,
        };
        info!(
            epoch = epoch,
            train_loss = train_loss,
            val_loss = val_loss,
            val_mae = val_mae;
            "epoch {epoch}/{} done", training.epochs
        );

        if best.is_none_or(|best| val_mae < best.val_mae) {
            model.save_checkpoint(&checkpoint)?;
            best = Some(summary);
        }
        epochs.push(summary);
    }

    let best = best.ok_or_else(|| QuakeErr::InvalidConfig("epochs must be positive".into()))?;
    info!(epoch = best.epoch, val_mae = best.val_mae; "kept the best model");

    let test = match &data.test_dir {
        Some(test_dir) => {
            model.load_checkpoint(&checkpoint)?;
            Some(run_test(&mut model, config, &reference, test_dir)?)
        }
        None => None,
    };

    Ok(FitReport {
        epochs,
        best_epoch: best.epoch,
        checkpoint,
        test,
    })
}

/// Tests the model stored in `checkpoint` on the configured test directory.
///
/// # Errors
/// `QuakeErr::InvalidConfig` if the run has no test directory.
pub fn evaluate<P: AsRef<Path>>(config: &RunConfig, checkpoint: P) -> Result<TestReport> {
    let test_dir = config
        .data
        .test_dir
        .as_ref()
        .ok_or_else(|| QuakeErr::InvalidConfig("test_dir is required to test a model".into()))?;

    let reference = ReferenceTable::from_path(&config.data.reference)?;
    let mut model = Cnn::new(
        config.model.model_config(),
        BackboneWeights::Random,
        config.training.seed,
    )?;
    model.load_checkpoint(checkpoint)?;

    run_test(&mut model, config, &reference, test_dir)
}

fn run_test(
    model: &mut Cnn,
    config: &RunConfig,
    reference: &ReferenceTable,
    test_dir: &Path,
) -> Result<TestReport> {
    let data = &config.data;
    let set = ImageSet::unlabeled(test_dir, reference, config.auxiliary())?;
    let mut loader = DataLoader::new(set, config.training.batch_size, data.image_size);

    training::test(model, loader.test_batches(), data.target, reference, &data.output_dir)
}
