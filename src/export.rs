use std::{
    fs,
    path::{Path, PathBuf},
};

use log::info;
use machine_learning::arch::metrics::mean_absolute_error;

use crate::{QuakeErr, Result, reference::ReferenceTable, target::Target};

/// The outcome of exporting a test set's predictions.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    /// The written predictions file.
    pub path: PathBuf,
    /// The mean absolute error, rounded to 3 decimals.
    pub mae: f64,
    pub rows: usize,
}

/// Rounds `x` to `decimals` decimal places, ties to even.
pub fn round_to(x: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (x * scale).round_ties_even() / scale
}

/// Formats a float in its shortest round trip form, keeping at least one decimal.
pub fn format_float(x: f64) -> String {
    let s = x.to_string();

    if !x.is_finite() || s.contains('.') {
        s
    } else {
        format!("{s}.0")
    }
}

/// The predictions file name for `target` and an already rounded `mae`.
pub fn report_file_name(target: Target, mae: f64) -> String {
    format!("Prediction({target}) - MAE = {}.csv", format_float(mae))
}

/// Joins predictions with their ground truth and writes them to `out_dir`.
///
/// Each prediction is rounded to the target's record precision for the file, and to its
/// metric precision for the error. The file is only created once every identifier has been
/// found in `reference`.
///
/// # Arguments
/// * `predictions` - The `(identifier, prediction)` pairs, in output order.
/// * `target` - The predicted quantity.
/// * `reference` - The ground truth table.
/// * `out_dir` - The directory to write the predictions file to, created if missing.
///
/// # Errors
/// `QuakeErr::EmptyDataset` without predictions, `QuakeErr::MissingReference` if an
/// identifier isn't in `reference`.
pub fn export_predictions(
    predictions: &[(String, f32)],
    target: Target,
    reference: &ReferenceTable,
    out_dir: &Path,
) -> Result<TestReport> {
    if predictions.is_empty() {
        return Err(QuakeErr::EmptyDataset("test set"));
    }

    let mut rows = Vec::with_capacity(predictions.len());
    let mut y_true = Vec::with_capacity(predictions.len());
    let mut y_pred = Vec::with_capacity(predictions.len());

    for (id, prediction) in predictions {
        let truth = reference.get(target, id)?;
        let prediction = *prediction as f64;

        rows.push((id.as_str(), truth, round_to(prediction, target.record_decimals())));
        y_true.push(truth);
        y_pred.push(round_to(prediction, target.metric_decimals()));
    }

    let mae = round_to(mean_absolute_error(&y_pred, &y_true)?, 3);

    fs::create_dir_all(out_dir)?;
    let path = out_dir.join(report_file_name(target, mae));
    let mut writer = csv::Writer::from_path(&path)?;

    writer.write_record(["id", target.output_field(), "prediction"])?;
    for (id, truth, prediction) in &rows {
        writer.write_record([
            *id,
            format_float(*truth).as_str(),
            format_float(*prediction).as_str(),
        ])?;
    }
    writer.flush()?;

    info!(rows = rows.len(), mae = mae; "predictions saved to {}", path.display());

    Ok(TestReport {
        path,
        mae,
        rows: rows.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ReferenceTable {
        let mut table = ReferenceTable::default();
        table.insert("A".into(), [5.0, 10.0, -120.5, 35.0]);
        table.insert("B".into(), [6.2, 33.0, 140.0, -3.5]);
        table
    }

    #[test]
    fn rounding_follows_decimals() {
        assert_eq!(round_to(5.04f32 as f64, 1), 5.0);
        assert_eq!(round_to(6.15f32 as f64, 1), 6.2);
        assert_eq!(round_to(-120.4567, 3), -120.457);
        assert_eq!(round_to(-120.4567, 2), -120.46);
    }

    #[test]
    fn exact_ties_round_to_even() {
        assert_eq!(round_to(6.25f32 as f64, 1), 6.2);
        assert_eq!(round_to(6.75f32 as f64, 1), 6.8);
        assert_eq!(round_to(-120.125, 2), -120.12);
        assert_eq!(round_to(-120.375, 2), -120.38);
    }

    #[test]
    fn ties_do_not_leak_into_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let predictions = vec![("B".to_string(), 6.25)];

        let report = export_predictions(&predictions, Target::Mag, &table(), dir.path()).unwrap();

        assert_eq!(report.mae, 0.0);
        assert_eq!(
            report.path.file_name().unwrap(),
            "Prediction(mag) - MAE = 0.0.csv"
        );
        let written = fs::read_to_string(&report.path).unwrap();
        assert_eq!(written, "id,Mag,prediction\nB,6.2,6.2\n");
    }

    #[test]
    fn floats_keep_one_decimal() {
        assert_eq!(format_float(5.0), "5.0");
        assert_eq!(format_float(6.2), "6.2");
        assert_eq!(format_float(-120.125), "-120.125");
        assert_eq!(format_float(0.0), "0.0");
    }

    #[test]
    fn magnitudes_are_rounded_and_written() {
        let dir = tempfile::tempdir().unwrap();
        let predictions = vec![("A".to_string(), 5.04), ("B".to_string(), 6.15)];

        let report = export_predictions(&predictions, Target::Mag, &table(), dir.path()).unwrap();

        assert_eq!(report.mae, 0.0);
        assert_eq!(report.rows, 2);
        assert_eq!(
            report.path.file_name().unwrap(),
            "Prediction(mag) - MAE = 0.0.csv"
        );

        let written = fs::read_to_string(&report.path).unwrap();
        assert_eq!(written, "id,Mag,prediction\nA,5.0,5.0\nB,6.2,6.2\n");
    }

    #[test]
    fn coordinates_are_scored_with_two_decimals() {
        let dir = tempfile::tempdir().unwrap();
        let predictions = vec![("A".to_string(), -120.4567)];

        let report = export_predictions(&predictions, Target::Lon, &table(), dir.path()).unwrap();

        // |-120.46 - -120.5|, the file keeps three decimals.
        assert_eq!(report.mae, 0.04);
        let written = fs::read_to_string(&report.path).unwrap();
        assert_eq!(written, "id,Lon,prediction\nA,-120.5,-120.457\n");
    }

    #[test]
    fn missing_identifier_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let predictions = vec![("A".to_string(), 5.0), ("Z".to_string(), 1.0)];

        let err = export_predictions(&predictions, Target::Mag, &table(), dir.path()).unwrap_err();

        assert!(matches!(err, QuakeErr::MissingReference { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn empty_predictions_fail() {
        let dir = tempfile::tempdir().unwrap();
        let result = export_predictions(&[], Target::Dep, &table(), dir.path());
        assert!(matches!(result, Err(QuakeErr::EmptyDataset(_))));
    }
}
