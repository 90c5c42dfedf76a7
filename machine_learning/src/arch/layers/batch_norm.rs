use ndarray::prelude::*;
use rand::Rng;

use crate::{
    MlErr, Result,
    arch::{Mode, Module, module::take_buffer},
    params::{BackIter, FrontIter, FrontIterMut},
    weights::WeightMap,
};

const EPS: f32 = 1e-5;
const MOMENTUM: f32 = 0.1;

/// Batch normalization over the channels of `(N, C, H, W)` batches.
///
/// Its parameters are the `C` scales followed by the `C` shifts, the running mean and
/// variance are kept as buffers.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    channels: usize,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,

    // Forward metadata
    xhat: Option<Array4<f32>>,
    inv_std: Array1<f32>,
    mode: Mode,
}

impl BatchNorm2d {
    /// Creates a new `BatchNorm2d` with a zero running mean and unit running variance.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            xhat: None,
            inv_std: Array1::zeros(channels),
            mode: Mode::Eval,
        }
    }

    pub fn running_mean(&self) -> ArrayView1<'_, f32> {
        self.running_mean.view()
    }

    pub fn running_var(&self) -> ArrayView1<'_, f32> {
        self.running_var.view()
    }
}

impl Module for BatchNorm2d {
    type Input = Array4<f32>;
    type Output = Array4<f32>;

    fn size(&self) -> usize {
        2 * self.channels
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, _rng: &mut R) -> Result<()> {
        let (gamma, beta) = params.take(self.size())?.split_at_mut(self.channels);
        gamma.fill(1.);
        beta.fill(0.);
        Ok(())
    }

    fn forward(&mut self, params: &mut FrontIter, x: Array4<f32>, mode: Mode) -> Result<Array4<f32>> {
        let (gamma, beta) = params.take(self.size())?.split_at(self.channels);
        let (n, c, h, w) = x.dim();

        if c != self.channels {
            return Err(MlErr::SizeMismatch {
                what: "batch norm channels",
                got: c,
                expected: self.channels,
            });
        }

        let m = n * h * w;
        let mut xhat = Array4::zeros(x.raw_dim());
        let mut y = Array4::zeros(x.raw_dim());

        for ch in 0..c {
            let xc = x.index_axis(Axis(1), ch);

            let (mean, var) = match mode {
                Mode::Train => {
                    if m == 0 {
                        return Err(MlErr::EmptyInput("batch norm input"));
                    }

                    let mean = xc.sum() / m as f32;
                    let var = xc.fold(0., |acc, &v| acc + (v - mean).powi(2)) / m as f32;

                    let unbiased = if m > 1 {
                        var * m as f32 / (m - 1) as f32
                    } else {
                        var
                    };

                    self.running_mean[ch] = (1. - MOMENTUM) * self.running_mean[ch] + MOMENTUM * mean;
                    self.running_var[ch] = (1. - MOMENTUM) * self.running_var[ch] + MOMENTUM * unbiased;
                    (mean, var)
                }
                Mode::Eval => (self.running_mean[ch], self.running_var[ch]),
            };

            let inv_std = 1. / (var + EPS).sqrt();
            self.inv_std[ch] = inv_std;

            let (g, b) = (gamma[ch], beta[ch]);
            let mut xhat_c = xhat.index_axis_mut(Axis(1), ch);
            let mut y_c = y.index_axis_mut(Axis(1), ch);

            xhat_c.zip_mut_with(&xc, |o, &v| *o = (v - mean) * inv_std);
            y_c.zip_mut_with(&xhat_c, |o, &v| *o = g * v + b);
        }

        self.xhat = Some(xhat);
        self.mode = mode;
        Ok(y)
    }

    fn backward(&mut self, params: &mut BackIter, d: Array4<f32>) -> Result<Array4<f32>> {
        let (raw, grad) = params.take(self.size())?;
        let xhat = self.xhat.take().ok_or(MlErr::NotForwarded("batch norm"))?;
        let (gamma, _) = raw.split_at(self.channels);
        let (dgamma, dbeta) = grad.split_at_mut(self.channels);

        let (n, _, h, w) = xhat.dim();
        let m = (n * h * w) as f32;
        let mut dx = Array4::zeros(xhat.raw_dim());

        for ch in 0..self.channels {
            let d_c = d.index_axis(Axis(1), ch);
            let xhat_c = xhat.index_axis(Axis(1), ch);

            let sum_d = d_c.sum();
            let sum_dx = (&d_c * &xhat_c).sum();
            dgamma[ch] += sum_dx;
            dbeta[ch] += sum_d;

            let scale = gamma[ch] * self.inv_std[ch];
            let mut dx_c = dx.index_axis_mut(Axis(1), ch);

            match self.mode {
                Mode::Train => {
                    ndarray::Zip::from(&mut dx_c)
                        .and(&d_c)
                        .and(&xhat_c)
                        .for_each(|o, &d, &xh| *o = scale / m * (m * d - sum_d - xh * sum_dx));
                }
                Mode::Eval => dx_c.zip_mut_with(&d_c, |o, &d| *o = scale * d),
            }
        }

        Ok(dx)
    }

    fn load(&mut self, params: &mut FrontIterMut, weights: &WeightMap, prefix: &str) -> Result<()> {
        let (gamma, beta) = params.take(self.size())?.split_at_mut(self.channels);
        let shape = [self.channels];

        weights.copy_into(&format!("{prefix}.weight"), &shape, gamma)?;
        weights.copy_into(&format!("{prefix}.bias"), &shape, beta)?;

        if let Some(mean) = self.running_mean.as_slice_mut() {
            weights.copy_into(&format!("{prefix}.running_mean"), &shape, mean)?;
        }

        if let Some(var) = self.running_var.as_slice_mut() {
            weights.copy_into(&format!("{prefix}.running_var"), &shape, var)?;
        }

        Ok(())
    }

    fn buffer_size(&self) -> usize {
        2 * self.channels
    }

    fn export_buffers(&self, out: &mut Vec<f32>) {
        out.extend(self.running_mean.iter());
        out.extend(self.running_var.iter());
    }

    fn import_buffers(&mut self, src: &mut &[f32]) -> Result<()> {
        let mean = take_buffer(src, self.channels)?;
        let var = take_buffer(src, self.channels)?;

        self.running_mean.assign(&ArrayView1::from(mean));
        self.running_var.assign(&ArrayView1::from(var));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{arch::layers::gradcheck, params::ParamStore};

    fn identity_store(channels: usize) -> ParamStore {
        let mut params = vec![1.; channels];
        params.extend(vec![0.; channels]);
        ParamStore::from_params(params)
    }

    #[test]
    fn init_starts_as_identity_affine() {
        let bn = BatchNorm2d::new(3);
        let mut store = ParamStore::zeros(bn.size());
        let mut rng = StdRng::seed_from_u64(0);

        bn.init(&mut store.front_mut(), &mut rng).unwrap();

        assert_eq!(store.params(), identity_store(3).params());
    }

    #[test]
    fn train_normalizes_each_channel() {
        let mut bn = BatchNorm2d::new(2);
        let store = identity_store(2);

        let x = Array4::from_shape_fn((2, 2, 2, 2), |(i, c, j, k)| (i * 4 + j * 2 + k) as f32 * (c + 1) as f32);
        let y = bn.forward(&mut store.front(), x, Mode::Train).unwrap();

        for ch in 0..2 {
            let y_c = y.index_axis(Axis(1), ch);
            let mean = y_c.sum() / 8.;
            let var = y_c.fold(0., |acc, &v| acc + (v - mean).powi(2)) / 8.;

            assert!(mean.abs() < 1e-5);
            assert!((var - 1.).abs() < 1e-3);
        }
    }

    #[test]
    fn train_updates_running_statistics() {
        let mut bn = BatchNorm2d::new(1);
        let store = identity_store(1);

        let x = Array4::from_shape_vec((2, 1, 1, 1), vec![1., 3.]).unwrap();
        bn.forward(&mut store.front(), x, Mode::Train).unwrap();

        assert!((bn.running_mean()[0] - 0.2).abs() < 1e-6);
        // Unbiased variance of [1, 3] is 2.
        assert!((bn.running_var()[0] - (0.9 + 0.2)).abs() < 1e-6);
    }

    #[test]
    fn eval_uses_running_statistics() {
        let mut bn = BatchNorm2d::new(1);
        let store = identity_store(1);

        bn.import_buffers(&mut &[2., 4.][..]).unwrap();
        let x = Array4::from_elem((1, 1, 1, 1), 4.);
        let y = bn.forward(&mut store.front(), x, Mode::Eval).unwrap();

        assert!((y[[0, 0, 0, 0]] - 1.).abs() < 1e-4);
        assert_eq!(bn.running_mean()[0], 2.);
    }

    #[test]
    fn buffers_round_trip() {
        let mut bn = BatchNorm2d::new(2);
        bn.import_buffers(&mut &[1., 2., 3., 4.][..]).unwrap();

        let mut out = Vec::new();
        bn.export_buffers(&mut out);
        assert_eq!(out, [1., 2., 3., 4.]);

        assert!(bn.import_buffers(&mut &[1.][..]).is_err());
    }

    #[test]
    fn train_gradients_match_finite_differences() {
        let x = gradcheck::random_input((3, 2, 3, 3), 21);
        gradcheck::check(BatchNorm2d::new(2), x, Mode::Train, 1e-2);
    }

    #[test]
    fn eval_gradients_match_finite_differences() {
        let x = gradcheck::random_input((2, 3, 2, 2), 22);
        gradcheck::check(BatchNorm2d::new(3), x, Mode::Eval, 1e-2);
    }
}
