use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use machine_learning::{
    arch::{Mode, loss::LossFn, metrics::mean_absolute_error},
    optimization::Optimizer,
};

use crate::{
    QuakeErr, Result,
    data::{Batch, TestBatch},
    export::{TestReport, export_predictions},
    model::Cnn,
    reference::ReferenceTable,
    target::Target,
};

fn progress_bar(len: usize, msg: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::with_template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
    {
        bar.set_style(style.progress_chars("#>-"));
    }

    bar.set_message(msg);
    bar
}

/// Runs one training epoch, updating the model after every batch.
///
/// # Arguments
/// * `model` - The model to train.
/// * `batches` - The labeled batches of the epoch, a failed one aborts it.
/// * `loss_fn` - The loss to minimize.
/// * `optimizer` - The update rule.
///
/// # Returns
/// The mean loss per sample.
///
/// # Errors
/// `QuakeErr::EmptyDataset` if there were no batches.
pub fn train<I, L, O>(model: &mut Cnn, batches: I, loss_fn: &L, optimizer: &mut O) -> Result<f32>
where
    I: IntoIterator<Item = Result<Batch>>,
    L: LossFn,
    O: Optimizer + ?Sized,
{
    let batches = batches.into_iter();
    let bar = progress_bar(batches.size_hint().0, "train");

    let mut total_loss = 0.;
    let mut seen = 0;

    for batch in batches {
        let Batch {
            images,
            labels,
            aux,
        } = batch?;

        model.zero_grad();
        let y_pred = model.forward(images, aux.as_ref().map(|aux| aux.view()), Mode::Train)?;
        check_batch(y_pred.len(), labels.len())?;

        let loss = loss_fn.loss(y_pred.view(), labels.view());
        let d = loss_fn.loss_prime(y_pred.view(), labels.view());
        model.backward(d.view())?;
        model.step(optimizer)?;

        debug!(samples = labels.len(), loss = loss; "training batch");
        total_loss += loss as f64 * labels.len() as f64;
        seen += labels.len();
        bar.inc(1);
    }

    bar.finish_and_clear();
    if seen == 0 {
        return Err(QuakeErr::EmptyDataset("training set"));
    }

    let loss = (total_loss / seen as f64) as f32;
    info!(samples = seen, loss = loss; "training pass done");
    Ok(loss)
}

/// Evaluates the model without changing it.
///
/// # Returns
/// The mean loss per sample and the mean absolute error of the raw predictions.
///
/// # Errors
/// `QuakeErr::EmptyDataset` if there were no batches.
pub fn validate<I, L>(model: &mut Cnn, batches: I, loss_fn: &L) -> Result<(f32, f32)>
where
    I: IntoIterator<Item = Result<Batch>>,
    L: LossFn,
{
    let batches = batches.into_iter();
    let bar = progress_bar(batches.size_hint().0, "validate");

    let mut total_loss = 0.;
    let mut y_true = Vec::new();
    let mut y_pred = Vec::new();

    for batch in batches {
        let Batch {
            images,
            labels,
            aux,
        } = batch?;

        let outputs = model.forward(images, aux.as_ref().map(|aux| aux.view()), Mode::Eval)?;
        check_batch(outputs.len(), labels.len())?;

        let loss = loss_fn.loss(outputs.view(), labels.view());
        total_loss += loss as f64 * labels.len() as f64;

        y_true.extend(labels.iter().map(|&y| y as f64));
        y_pred.extend(outputs.iter().map(|&y| y as f64));
        bar.inc(1);
    }

    bar.finish_and_clear();
    if y_true.is_empty() {
        return Err(QuakeErr::EmptyDataset("validation set"));
    }

    let loss = (total_loss / y_true.len() as f64) as f32;
    let mae = mean_absolute_error(&y_pred, &y_true)? as f32;

    info!(samples = y_true.len(), loss = loss, mae = mae; "validation pass done");
    Ok((loss, mae))
}

/// Predicts every test image and exports the predictions with their ground truth.
///
/// # Arguments
/// * `model` - The model to evaluate.
/// * `batches` - The identified test batches.
/// * `target` - The quantity the model predicts.
/// * `reference` - The ground truth table.
/// * `out_dir` - Where to write the predictions file.
pub fn test<I>(
    model: &mut Cnn,
    batches: I,
    target: Target,
    reference: &ReferenceTable,
    out_dir: &Path,
) -> Result<TestReport>
where
    I: IntoIterator<Item = Result<TestBatch>>,
{
    let batches = batches.into_iter();
    let bar = progress_bar(batches.size_hint().0, "test");

    let mut predictions = Vec::new();
    for batch in batches {
        let TestBatch { images, ids, aux } = batch?;

        let outputs = model.forward(images, aux.as_ref().map(|aux| aux.view()), Mode::Eval)?;
        check_batch(outputs.len(), ids.len())?;

        predictions.extend(ids.into_iter().zip(outputs.iter().copied()));
        bar.inc(1);
    }

    bar.finish_and_clear();
    export_predictions(&predictions, target, reference, out_dir)
}

fn check_batch(got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(QuakeErr::BatchMismatch {
            what: "predictions",
            got,
            expected,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use machine_learning::{arch::loss::Mse, optimization::GradientDescent};
    use ndarray::{Array1, Array2, Array4};

    use super::*;
    use crate::model::{Backbone, BackboneWeights, ModelConfig};

    fn model(use_auxiliary_parameters: bool) -> Cnn {
        let config = ModelConfig {
            backbone: Backbone::SimpleCnn,
            use_auxiliary_parameters,
        };
        Cnn::new(config, BackboneWeights::Random, 11).unwrap()
    }

    fn batch(n: usize, label: f32) -> Result<Batch> {
        Ok(Batch {
            images: Array4::from_shape_fn((n, 3, 8, 8), |(_, c, y, x)| ((c + y + x) % 3) as f32),
            labels: Array1::from_elem(n, label),
            aux: Some(Array2::from_elem((n, 2), 0.5)),
        })
    }

    #[test]
    fn training_lowers_the_loss_on_a_fixed_batch() {
        let mut model = model(true);
        let mut optimizer = GradientDescent::new(1e-2);

        let first = train(&mut model, [batch(4, 3.)], &Mse, &mut optimizer).unwrap();
        for _ in 0..20 {
            train(&mut model, [batch(4, 3.)], &Mse, &mut optimizer).unwrap();
        }
        let last = train(&mut model, [batch(4, 3.)], &Mse, &mut optimizer).unwrap();

        assert!(last < first);
    }

    #[test]
    fn losses_are_weighted_by_batch_size() {
        let mut model = model(true);
        let single = batch(1, 0.).unwrap();
        let aux = single.aux.as_ref().map(|aux| aux.view());
        let prediction = model.forward(single.images.clone(), aux, Mode::Eval).unwrap()[0];

        // Every image of `batch` is the same, so is every prediction.
        let (loss, mae) = validate(&mut model, [batch(3, 0.), batch(1, 2.)], &Mse).unwrap();

        let expected_loss = (3. * prediction.powi(2) + (prediction - 2.).powi(2)) / 4.;
        let expected_mae = (3. * prediction.abs() + (prediction - 2.).abs()) / 4.;
        assert!((loss - expected_loss).abs() < 1e-4);
        assert!((mae - expected_mae).abs() < 1e-4);
    }

    #[test]
    fn training_loss_is_weighted_by_batch_size() {
        let mut model = model(true);
        let single = batch(1, 0.).unwrap();
        let aux = single.aux.as_ref().map(|aux| aux.view());
        let prediction = model.forward(single.images.clone(), aux, Mode::Train).unwrap()[0];

        // A zero learning rate keeps every prediction equal to `prediction`.
        let mut optimizer = GradientDescent::new(0.);
        let loss = train(&mut model, [batch(3, 0.), batch(1, 2.)], &Mse, &mut optimizer).unwrap();

        let expected = (3. * prediction.powi(2) + (prediction - 2.).powi(2)) / 4.;
        assert!((loss - expected).abs() < 1e-4);
    }

    #[test]
    fn validation_leaves_the_model_untouched() {
        let mut model = model(true);
        let params = model.params().to_vec();

        validate(&mut model, [batch(2, 1.)], &Mse).unwrap();

        assert_eq!(model.params(), &params[..]);
        assert!(model.grad().iter().all(|&g| g == 0.));
    }

    #[test]
    fn empty_passes_fail() {
        let mut model = model(true);
        let mut optimizer = GradientDescent::new(1e-2);

        assert!(matches!(
            train(&mut model, Vec::<Result<Batch>>::new(), &Mse, &mut optimizer),
            Err(QuakeErr::EmptyDataset(_))
        ));
        assert!(matches!(
            validate(&mut model, Vec::<Result<Batch>>::new(), &Mse),
            Err(QuakeErr::EmptyDataset(_))
        ));
    }

    #[test]
    fn failed_batches_abort_the_pass() {
        let mut model = model(true);
        let mut optimizer = GradientDescent::new(1e-2);
        let batches = vec![batch(2, 1.), Err(QuakeErr::EmptyDataset("broken"))];

        assert!(train(&mut model, batches, &Mse, &mut optimizer).is_err());
    }

    #[test]
    fn test_exports_every_prediction() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = model(false);

        let mut reference = ReferenceTable::default();
        reference.insert("a".into(), [5.0, 10.0, 1.0, 2.0]);
        reference.insert("b".into(), [6.0, 20.0, 3.0, 4.0]);

        let batch = TestBatch {
            images: Array4::zeros((2, 3, 8, 8)),
            ids: vec!["a".into(), "b".into()],
            aux: None,
        };

        let report = test(&mut model, [Ok(batch)], Target::Dep, &reference, dir.path()).unwrap();

        assert_eq!(report.rows, 2);
        assert!(report.path.exists());
    }
}
