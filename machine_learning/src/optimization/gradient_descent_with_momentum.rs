use super::{Optimizer, check_lengths};
use crate::Result;

#[derive(Debug, Clone)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    ///
    /// # Returns
    /// A new `GradientDescentWithMomentum` instance.
    pub fn new(len: usize, learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_lengths(grad, params)?;
        check_lengths(&self.velocity, params)?;

        let lr = self.learning_rate;
        let mu = self.momentum;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = (mu * *v) + g;
                *p -= lr * *v;
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_accumulates() {
        let mut optimizer = GradientDescentWithMomentum::new(1, 1., 0.5);
        let mut params = [0.];

        optimizer.update_params(&[1.], &mut params).unwrap();
        assert_eq!(params, [-1.]);

        optimizer.update_params(&[1.], &mut params).unwrap();
        assert_eq!(params, [-2.5]);
    }
}
