use crate::{MlErr, Result};

/// A `ParamGen` generates values for the initial state of the model's parameters.
pub trait ParamGen {
    /// Should sample at most `n` parameters.
    ///
    /// # Arguments
    /// * `n` - The upper limit of samples to generate.
    ///
    /// # Returns
    /// An option whether the generator is exhausted.
    fn sample(&mut self, n: usize) -> Option<Vec<f32>>;

    /// Fills the whole `dst` slice with generated values.
    ///
    /// # Errors
    /// Returns `MlErr::SizeMismatch` if the generator runs out before `dst` is filled.
    fn fill(&mut self, dst: &mut [f32]) -> Result<()> {
        let mut filled = 0;

        while filled < dst.len() {
            let Some(sample) = self.sample(dst.len() - filled) else {
                return Err(MlErr::SizeMismatch {
                    what: "generated parameters",
                    got: filled,
                    expected: dst.len(),
                });
            };

            dst[filled..filled + sample.len()].copy_from_slice(&sample);
            filled += sample.len();
        }

        Ok(())
    }
}
