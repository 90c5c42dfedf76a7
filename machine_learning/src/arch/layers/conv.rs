use ndarray::{linalg, prelude::*};
use rand::Rng;
use rayon::prelude::*;

use crate::{
    MlErr, Result,
    arch::{Mode, Module},
    initialization::{ParamGen, RandParamGen},
    params::{BackIter, FrontIter, FrontIterMut},
    weights::WeightMap,
};

/// Spatial sizes of a convolution over a particular input.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    kernel: usize,
    stride: usize,
    padding: usize,
    h: usize,
    w: usize,
    oh: usize,
    ow: usize,
}

impl Geometry {
    fn new(kernel: usize, stride: usize, padding: usize, h: usize, w: usize) -> Result<Self> {
        let out_len = |len: usize| {
            (len + 2 * padding)
                .checked_sub(kernel)
                .map(|span| span / stride + 1)
                .ok_or(MlErr::SizeMismatch {
                    what: "spatial input smaller than the kernel",
                    got: len + 2 * padding,
                    expected: kernel,
                })
        };

        Ok(Self {
            kernel,
            stride,
            padding,
            h,
            w,
            oh: out_len(h)?,
            ow: out_len(w)?,
        })
    }

    /// Maps an output coordinate and kernel offset to an input coordinate, if it isn't padding.
    fn source(&self, out: usize, offset: usize, len: usize) -> Option<usize> {
        (out * self.stride + offset)
            .checked_sub(self.padding)
            .filter(|&i| i < len)
    }
}

/// Unfolds the receptive fields of channels `c0..c0 + cg` of a single `(C, H, W)` sample into
/// a `(cg * k * k, oh * ow)` matrix.
fn im2col(x: ArrayView3<f32>, c0: usize, cg: usize, geo: &Geometry) -> Array2<f32> {
    let k = geo.kernel;
    let mut cols = Array2::zeros((cg * k * k, geo.oh * geo.ow));

    for c in 0..cg {
        let plane = x.index_axis(Axis(0), c0 + c);

        for ki in 0..k {
            for kj in 0..k {
                let mut row = cols.row_mut((c * k + ki) * k + kj);

                for oy in 0..geo.oh {
                    let Some(iy) = geo.source(oy, ki, geo.h) else {
                        continue;
                    };

                    for ox in 0..geo.ow {
                        if let Some(ix) = geo.source(ox, kj, geo.w) {
                            row[oy * geo.ow + ox] = plane[[iy, ix]];
                        }
                    }
                }
            }
        }
    }

    cols
}

/// The adjoint of `im2col`, accumulates `cols` back into channels `c0..c0 + cg` of `dx`.
fn col2im(cols: ArrayView2<f32>, dx: &mut Array3<f32>, c0: usize, cg: usize, geo: &Geometry) {
    let k = geo.kernel;

    for c in 0..cg {
        let mut plane = dx.index_axis_mut(Axis(0), c0 + c);

        for ki in 0..k {
            for kj in 0..k {
                let row = cols.row((c * k + ki) * k + kj);

                for oy in 0..geo.oh {
                    let Some(iy) = geo.source(oy, ki, geo.h) else {
                        continue;
                    };

                    for ox in 0..geo.ow {
                        if let Some(ix) = geo.source(ox, kj, geo.w) {
                            plane[[iy, ix]] += row[oy * geo.ow + ox];
                        }
                    }
                }
            }
        }
    }
}

/// Stacks per sample results of equal shape into a single batch array.
fn stack<D: Dimension>(samples: Vec<Array<f32, D>>, shape: (usize, usize, usize, usize)) -> Result<Array4<f32>> {
    let mut data = Vec::with_capacity(shape.0 * shape.1 * shape.2 * shape.3);
    for sample in &samples {
        data.extend(sample.iter());
    }

    Ok(Array4::from_shape_vec(shape, data)?)
}

/// A 2D convolution over `(N, C, H, W)` batches, computed as a matrix product over unfolded
/// receptive fields.
///
/// Its parameters are the `(out, in / groups, k, k)` kernel followed, if enabled, by the `out`
/// biases.
#[derive(Debug, Clone)]
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    groups: usize,
    bias: bool,

    // Forward metadata
    x: Option<Array4<f32>>,
}

impl Conv2d {
    /// Creates a new `Conv2d` with stride 1, no padding, a single group and biases.
    ///
    /// # Arguments
    /// * `in_channels` - The amount of input channels.
    /// * `out_channels` - The amount of output channels.
    /// * `kernel` - The side of the square kernel.
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride: 1,
            padding: 0,
            groups: 1,
            bias: true,
            x: None,
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride.max(1);
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// Splits the channels in `groups` independent convolutions, `groups == in_channels` makes
    /// it a depthwise convolution.
    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups.max(1);
        self
    }

    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn group_in(&self) -> usize {
        self.in_channels / self.groups
    }

    fn group_out(&self) -> usize {
        self.out_channels / self.groups
    }

    fn weights_len(&self) -> usize {
        self.out_channels * self.group_in() * self.kernel * self.kernel
    }

    fn check_input(&self, c: usize) -> Result<()> {
        if c != self.in_channels {
            return Err(MlErr::SizeMismatch {
                what: "convolution input channels",
                got: c,
                expected: self.in_channels,
            });
        }

        if self.in_channels % self.groups != 0 || self.out_channels % self.groups != 0 {
            return Err(MlErr::SizeMismatch {
                what: "convolution groups",
                got: self.groups,
                expected: self.in_channels,
            });
        }

        Ok(())
    }

    fn view_weights<'a>(&self, params: &'a [f32]) -> Result<ArrayView2<'a, f32>> {
        let shape = (self.out_channels, self.group_in() * self.kernel * self.kernel);
        Ok(ArrayView2::from_shape(shape, &params[..self.weights_len()])?)
    }
}

impl Module for Conv2d {
    type Input = Array4<f32>;
    type Output = Array4<f32>;

    fn size(&self) -> usize {
        self.weights_len() + if self.bias { self.out_channels } else { 0 }
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> Result<()> {
        let dst = params.take(self.size())?;
        let fan_in = self.group_in() * self.kernel * self.kernel;
        RandParamGen::fan_in_uniform(rng, dst.len(), fan_in)?.fill(dst)
    }

    fn forward(&mut self, params: &mut FrontIter, x: Array4<f32>, _mode: Mode) -> Result<Array4<f32>> {
        let raw = params.take(self.size())?;
        let (n, c, h, w) = x.dim();
        self.check_input(c)?;

        let geo = Geometry::new(self.kernel, self.stride, self.padding, h, w)?;
        let weights = self.view_weights(raw)?;
        let bias = self
            .bias
            .then(|| ArrayView1::from(&raw[self.weights_len()..]));

        let (groups, cin_g, cout_g) = (self.groups, self.group_in(), self.group_out());
        let out = self.out_channels;

        let samples: Vec<Array2<f32>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let xi = x.index_axis(Axis(0), i);
                let mut yi = Array2::zeros((out, geo.oh * geo.ow));

                for g in 0..groups {
                    let cols = im2col(xi, g * cin_g, cin_g, &geo);
                    let wg = weights.slice(s![g * cout_g..(g + 1) * cout_g, ..]);
                    let mut yg = yi.slice_mut(s![g * cout_g..(g + 1) * cout_g, ..]);
                    linalg::general_mat_mul(1.0, &wg, &cols, 0.0, &mut yg);
                }

                if let Some(b) = bias {
                    yi += &b.insert_axis(Axis(1));
                }

                yi
            })
            .collect();

        let y = stack(samples, (n, out, geo.oh, geo.ow))?;
        self.x = Some(x);
        Ok(y)
    }

    fn backward(&mut self, params: &mut BackIter, d: Array4<f32>) -> Result<Array4<f32>> {
        let (raw, grad) = params.take(self.size())?;
        let x = self.x.take().ok_or(MlErr::NotForwarded("convolution"))?;
        let (n, c, h, w) = x.dim();

        let geo = Geometry::new(self.kernel, self.stride, self.padding, h, w)?;
        let weights = self.view_weights(raw)?;
        let (groups, cin_g, cout_g) = (self.groups, self.group_in(), self.group_out());
        let out = self.out_channels;
        let w_shape = weights.raw_dim();

        let d = d.to_shape((n, out, geo.oh * geo.ow))?;
        let d = d.view();

        let (dw_raw, db_raw) = grad.split_at_mut(self.weights_len());

        if self.bias {
            for (o, db) in db_raw.iter_mut().enumerate() {
                *db += d.index_axis(Axis(1), o).sum();
            }
        }

        let dw_batch = (0..n)
            .into_par_iter()
            .fold(
                || Array2::<f32>::zeros(w_shape),
                |mut acc, i| {
                    let xi = x.index_axis(Axis(0), i);
                    let di = d.index_axis(Axis(0), i);

                    for g in 0..groups {
                        let cols = im2col(xi, g * cin_g, cin_g, &geo);
                        let dg = di.slice(s![g * cout_g..(g + 1) * cout_g, ..]);
                        let mut acc_g = acc.slice_mut(s![g * cout_g..(g + 1) * cout_g, ..]);
                        linalg::general_mat_mul(1.0, &dg, &cols.t(), 1.0, &mut acc_g);
                    }

                    acc
                },
            )
            .reduce(|| Array2::zeros(w_shape), |a, b| a + b);

        let mut dw = ArrayViewMut2::from_shape(w_shape, dw_raw)?;
        dw += &dw_batch;

        let samples: Vec<Array3<f32>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let di = d.index_axis(Axis(0), i);
                let mut dxi = Array3::zeros((c, h, w));

                for g in 0..groups {
                    let wg = weights.slice(s![g * cout_g..(g + 1) * cout_g, ..]);
                    let dg = di.slice(s![g * cout_g..(g + 1) * cout_g, ..]);
                    let dcols = wg.t().dot(&dg);
                    col2im(dcols.view(), &mut dxi, g * cin_g, cin_g, &geo);
                }

                dxi
            })
            .collect();

        stack(samples, (n, c, h, w))
    }

    fn load(&mut self, params: &mut FrontIterMut, weights: &WeightMap, prefix: &str) -> Result<()> {
        let dst = params.take(self.size())?;
        let (w_dst, b_dst) = dst.split_at_mut(self.weights_len());

        let shape = [self.out_channels, self.group_in(), self.kernel, self.kernel];
        weights.copy_into(&format!("{prefix}.weight"), &shape, w_dst)?;

        if self.bias {
            weights.copy_into(&format!("{prefix}.bias"), &[self.out_channels], b_dst)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arch::layers::gradcheck, params::ParamStore};

    #[test]
    fn output_size_follows_stride_and_padding() {
        let mut conv = Conv2d::new(3, 8, 3).stride(2).padding(1);
        let store = ParamStore::zeros(conv.size());

        let y = conv
            .forward(&mut store.front(), Array4::zeros((2, 3, 9, 7)), Mode::Eval)
            .unwrap();

        assert_eq!(y.dim(), (2, 8, 5, 4));
    }

    #[test]
    fn identity_kernel_copies_input() {
        let mut conv = Conv2d::new(1, 1, 3).padding(1).bias(false);
        let mut kernel = vec![0.; 9];
        kernel[4] = 1.;
        let store = ParamStore::from_params(kernel);

        let x = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, i, j)| (i * 4 + j) as f32);
        let y = conv.forward(&mut store.front(), x.clone(), Mode::Eval).unwrap();

        assert_eq!(y, x);
    }

    #[test]
    fn depthwise_keeps_channels_apart() {
        let mut conv = Conv2d::new(2, 2, 1).groups(2).bias(false);
        let store = ParamStore::from_params(vec![2., -1.]);

        let x = Array4::from_elem((1, 2, 2, 2), 1.);
        let y = conv.forward(&mut store.front(), x, Mode::Eval).unwrap();

        assert!(y.index_axis(Axis(1), 0).iter().all(|&v| v == 2.));
        assert!(y.index_axis(Axis(1), 1).iter().all(|&v| v == -1.));
    }

    #[test]
    fn too_small_input_fails() {
        let mut conv = Conv2d::new(1, 1, 5);
        let store = ParamStore::zeros(conv.size());

        let result = conv.forward(&mut store.front(), Array4::zeros((1, 1, 3, 3)), Mode::Eval);
        assert!(result.is_err());
    }

    #[test]
    fn gradients_match_finite_differences() {
        let conv = Conv2d::new(3, 4, 3).stride(2).padding(1);
        let x = gradcheck::random_input((2, 3, 6, 5), 11);
        gradcheck::check(conv, x, Mode::Train, 1e-2);
    }

    #[test]
    fn grouped_gradients_match_finite_differences() {
        let conv = Conv2d::new(4, 4, 3).padding(1).groups(4).bias(false);
        let x = gradcheck::random_input((2, 4, 4, 4), 12);
        gradcheck::check(conv, x, Mode::Train, 1e-2);
    }
}
