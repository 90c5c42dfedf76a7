use ndarray::{Array1, ArrayView1};

/// A loss over a batch of scalar predictions.
pub trait LossFn {
    fn loss(&self, y_pred: ArrayView1<f32>, y: ArrayView1<f32>) -> f32;

    /// The gradient of `loss` with respect to `y_pred`.
    fn loss_prime(&self, y_pred: ArrayView1<f32>, y: ArrayView1<f32>) -> Array1<f32>;
}
