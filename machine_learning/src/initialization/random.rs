use rand::Rng;
use rand_distr::{Distribution, Uniform};

use super::ParamGen;
use crate::{MlErr, Result};

/// A parameter generator that follows a certain probabilistic distribution.
pub struct RandParamGen<'r, R: Rng, D: Distribution<f32>> {
    rng: &'r mut R,
    distribution: D,
    remaining: usize,
}

impl<'r, R: Rng, D: Distribution<f32>> RandParamGen<'r, R, D> {
    /// Creates a new `RandParamGen` parameter generator.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `distribution` - The distribution to sample the random numbers from.
    /// * `limit` - The maximum amount of numbers to generate.
    pub fn new(rng: &'r mut R, distribution: D, limit: usize) -> Self {
        Self {
            rng,
            distribution,
            remaining: limit,
        }
    }
}

impl<'r, R: Rng> RandParamGen<'r, R, Uniform<f32>> {
    /// Creates a new `RandParamGen` with a uniform distribution.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `limit` - The maximum amount of numbers to generate.
    /// * `low` - The inclusive lower limit.
    /// * `high` - The exclusive upper limit.
    ///
    /// # Returns
    /// An error if the range is invalid (low >= high).
    pub fn uniform(rng: &'r mut R, limit: usize, low: f32, high: f32) -> Result<Self> {
        let distribution =
            Uniform::new(low, high).map_err(|e| MlErr::InvalidDistribution(e.to_string()))?;
        Ok(Self::new(rng, distribution, limit))
    }

    /// Creates a new `RandParamGen` using the default initialization of linear and
    /// convolutional layers, uniform in `[-1 / sqrt(fan_in), 1 / sqrt(fan_in))`.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `limit` - The maximum amount of numbers to generate.
    /// * `fan_in` - The number of input units feeding each output.
    pub fn fan_in_uniform(rng: &'r mut R, limit: usize, fan_in: usize) -> Result<Self> {
        let bound = 1. / (fan_in.max(1) as f32).sqrt();
        Self::uniform(rng, limit, -bound, bound)
    }
}

impl<R: Rng, D: Distribution<f32>> ParamGen for RandParamGen<'_, R, D> {
    fn sample(&mut self, mut n: usize) -> Option<Vec<f32>> {
        if self.remaining == 0 {
            return None;
        }

        n = n.min(self.remaining);
        self.remaining -= n;

        let sample = (0..n)
            .map(|_| self.distribution.sample(&mut *self.rng))
            .collect();

        Some(sample)
    }
}
