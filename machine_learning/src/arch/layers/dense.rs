use ndarray::{linalg, prelude::*};
use rand::Rng;

use crate::{
    MlErr, Result,
    arch::{Mode, Module, activations::ActFn},
    initialization::{ParamGen, RandParamGen},
    params::{BackIter, FrontIter, FrontIterMut},
    weights::WeightMap,
};

/// A fully connected layer. Its parameters are the `(in, out)` weight matrix followed by
/// the `out` biases.
#[derive(Debug, Clone)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,

    // Forward metadata
    x: Option<Array2<f32>>,
    z: Option<Array2<f32>>,
}

impl Dense {
    /// Creates a new `Dense` layer.
    ///
    /// # Arguments
    /// * `dim` - The input and output widths.
    /// * `act_fn` - An optional activation applied to the output.
    ///
    /// # Returns
    /// A new `Dense` instance.
    pub fn new(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self {
            dim,
            act_fn,
            x: None,
            z: None,
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    fn view_params<'a>(&self, params: &'a [f32]) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let (w_raw, b_raw) = params.split_at(self.dim.0 * self.dim.1);
        let weights = ArrayView2::from_shape(self.dim, w_raw)?;
        let biases = ArrayView1::from_shape(self.dim.1, b_raw)?;
        Ok((weights, biases))
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        let (dw_raw, db_raw) = grad.split_at_mut(self.dim.0 * self.dim.1);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw)?;
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw)?;
        Ok((dw, db))
    }
}

impl Module for Dense {
    type Input = Array2<f32>;
    type Output = Array2<f32>;

    fn size(&self) -> usize {
        (self.dim.0 + 1) * self.dim.1
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> Result<()> {
        let dst = params.take(self.size())?;
        RandParamGen::fan_in_uniform(rng, dst.len(), self.dim.0)?.fill(dst)
    }

    fn forward(&mut self, params: &mut FrontIter, x: Array2<f32>, _mode: Mode) -> Result<Array2<f32>> {
        let raw = params.take(self.size())?;

        if x.ncols() != self.dim.0 {
            return Err(MlErr::SizeMismatch {
                what: "dense input width",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let (w, b) = self.view_params(raw)?;
        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        z += &b;

        let a = match &self.act_fn {
            Some(act_fn) => z.mapv(|z| act_fn.f(z)),
            None => z.clone(),
        };

        self.x = Some(x);
        self.z = Some(z);
        Ok(a)
    }

    fn backward(&mut self, params: &mut BackIter, mut d: Array2<f32>) -> Result<Array2<f32>> {
        let (raw, grad) = params.take(self.size())?;
        let x = self.x.take().ok_or(MlErr::NotForwarded("dense"))?;
        let z = self.z.take().ok_or(MlErr::NotForwarded("dense"))?;

        if let Some(act_fn) = &self.act_fn {
            d.zip_mut_with(&z, |d, &z| *d *= act_fn.df(z));
        }

        let (mut dw, mut db) = self.view_grad(grad)?;
        linalg::general_mat_mul(1.0, &x.t(), &d, 1.0, &mut dw);
        db += &d.sum_axis(Axis(0));

        let (w, _) = self.view_params(raw)?;
        let mut dx = Array2::zeros((d.nrows(), self.dim.0));
        linalg::general_mat_mul(1.0, &d, &w.t(), 0.0, &mut dx);

        Ok(dx)
    }

    /// Linear layers are stored as `(out, in)` weight matrices, they get transposed on load.
    fn load(&mut self, params: &mut FrontIterMut, weights: &WeightMap, prefix: &str) -> Result<()> {
        let dst = params.take(self.size())?;
        let (w_dst, b_dst) = dst.split_at_mut(self.dim.0 * self.dim.1);

        let name = format!("{prefix}.weight");
        let mut transposed = vec![0.; w_dst.len()];
        weights.copy_into(&name, &[self.dim.1, self.dim.0], &mut transposed)?;

        let src = ArrayView2::from_shape((self.dim.1, self.dim.0), &transposed[..])?;
        ArrayViewMut2::from_shape(self.dim, w_dst)?.assign(&src.t());

        weights.copy_into(&format!("{prefix}.bias"), &[self.dim.1], b_dst)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::{arch::layers::gradcheck, params::ParamStore};

    #[test]
    fn forward_multiplies_and_adds_bias() {
        let mut dense = Dense::new((2, 1), None);
        let store = ParamStore::from_params(vec![2., 3., 1.]);

        let y = dense
            .forward(&mut store.front(), array![[1., 1.], [0., 2.]], Mode::Eval)
            .unwrap();

        assert_eq!(y, array![[6.], [7.]]);
    }

    #[test]
    fn backward_without_forward_fails() {
        let mut dense = Dense::new((2, 1), None);
        let mut store = ParamStore::zeros(3);

        let result = dense.backward(&mut store.back(), array![[1.]]);
        assert!(matches!(result, Err(MlErr::NotForwarded(_))));
    }

    #[test]
    fn wrong_width_fails() {
        let mut dense = Dense::new((3, 1), None);
        let store = ParamStore::zeros(4);

        let result = dense.forward(&mut store.front(), Array2::zeros((2, 2)), Mode::Eval);
        assert!(matches!(result, Err(MlErr::SizeMismatch { .. })));
    }

    #[test]
    fn gradients_match_finite_differences() {
        let dense = Dense::new((4, 3), Some(ActFn::silu()));
        let x = gradcheck::random_input((5, 4), 1);
        gradcheck::check(dense, x, Mode::Train, 1e-2);
    }
}
