use crate::{MlErr, Result};

/// Computes the mean absolute error between two equally long series.
///
/// # Errors
/// `MlErr::EmptyInput` if the series are empty, `MlErr::SizeMismatch` if their lengths differ.
pub fn mean_absolute_error(y_pred: &[f64], y: &[f64]) -> Result<f64> {
    if y_pred.len() != y.len() {
        return Err(MlErr::SizeMismatch {
            what: "predictions and references",
            got: y_pred.len(),
            expected: y.len(),
        });
    }

    if y.is_empty() {
        return Err(MlErr::EmptyInput("series to compare"));
    }

    let total: f64 = y_pred.iter().zip(y).map(|(p, t)| (p - t).abs()).sum();
    Ok(total / y.len() as f64)
}
