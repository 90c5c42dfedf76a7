use ndarray::prelude::*;
use rand::Rng;
use rayon::prelude::*;

use crate::{
    MlErr, Result,
    arch::{Mode, Module},
    params::{BackIter, FrontIter, FrontIterMut},
};

/// Max pooling over square windows, padding counts as negative infinity.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    kernel: usize,
    stride: usize,
    padding: usize,

    // Forward metadata: the flat input index of every output's maximum.
    argmax: Option<(Vec<usize>, (usize, usize, usize, usize))>,
}

impl MaxPool2d {
    /// Creates a new `MaxPool2d` with the stride equal to the kernel and no padding.
    pub fn new(kernel: usize) -> Self {
        Self {
            kernel,
            stride: kernel.max(1),
            padding: 0,
            argmax: None,
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

    fn out_len(&self, len: usize) -> Result<usize> {
        (len + 2 * self.padding)
            .checked_sub(self.kernel)
            .map(|span| span / self.stride + 1)
            .ok_or(MlErr::SizeMismatch {
                what: "spatial input smaller than the pooling window",
                got: len + 2 * self.padding,
                expected: self.kernel,
            })
    }
}

impl Module for MaxPool2d {
    type Input = Array4<f32>;
    type Output = Array4<f32>;

    fn size(&self) -> usize {
        0
    }

    fn init<R: Rng>(&self, _params: &mut FrontIterMut, _rng: &mut R) -> Result<()> {
        Ok(())
    }

    fn forward(&mut self, _params: &mut FrontIter, x: Array4<f32>, _mode: Mode) -> Result<Array4<f32>> {
        let (n, c, h, w) = x.dim();
        let (oh, ow) = (self.out_len(h)?, self.out_len(w)?);
        let (k, s, p) = (self.kernel, self.stride, self.padding);

        let planes = x.to_shape((n * c, h, w))?;
        let planes = planes.view();

        let pooled: Vec<(Vec<f32>, Vec<usize>)> = (0..n * c)
            .into_par_iter()
            .map(|pi| {
                let plane = planes.index_axis(Axis(0), pi);
                let mut values = Vec::with_capacity(oh * ow);
                let mut indices = Vec::with_capacity(oh * ow);

                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_idx = pi * h * w;

                        for ki in 0..k {
                            let Some(iy) = (oy * s + ki).checked_sub(p).filter(|&i| i < h) else {
                                continue;
                            };

                            for kj in 0..k {
                                let Some(ix) = (ox * s + kj).checked_sub(p).filter(|&i| i < w)
                                else {
                                    continue;
                                };

                                let v = plane[[iy, ix]];
                                if v > best {
                                    best = v;
                                    best_idx = pi * h * w + iy * w + ix;
                                }
                            }
                        }

                        values.push(best);
                        indices.push(best_idx);
                    }
                }

                (values, indices)
            })
            .collect();

        let mut data = Vec::with_capacity(n * c * oh * ow);
        let mut argmax = Vec::with_capacity(n * c * oh * ow);
        for (values, indices) in pooled {
            data.extend(values);
            argmax.extend(indices);
        }

        self.argmax = Some((argmax, (n, c, h, w)));
        Ok(Array4::from_shape_vec((n, c, oh, ow), data)?)
    }

    fn backward(&mut self, _params: &mut BackIter, d: Array4<f32>) -> Result<Array4<f32>> {
        let (argmax, shape) = self.argmax.take().ok_or(MlErr::NotForwarded("max pooling"))?;

        if d.len() != argmax.len() {
            return Err(MlErr::SizeMismatch {
                what: "max pooling gradient",
                got: d.len(),
                expected: argmax.len(),
            });
        }

        let mut dx = vec![0.; shape.0 * shape.1 * shape.2 * shape.3];
        for (&i, &g) in argmax.iter().zip(d.iter()) {
            dx[i] += g;
        }

        Ok(Array4::from_shape_vec(shape, dx)?)
    }
}

/// Averages every channel over its whole spatial extent, `(N, C, H, W) -> (N, C)`.
#[derive(Debug, Clone, Default)]
pub struct GlobalAvgPool {
    shape: Option<(usize, usize, usize, usize)>,
}

impl GlobalAvgPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for GlobalAvgPool {
    type Input = Array4<f32>;
    type Output = Array2<f32>;

    fn size(&self) -> usize {
        0
    }

    fn init<R: Rng>(&self, _params: &mut FrontIterMut, _rng: &mut R) -> Result<()> {
        Ok(())
    }

    fn forward(&mut self, _params: &mut FrontIter, x: Array4<f32>, _mode: Mode) -> Result<Array2<f32>> {
        let (n, c, h, w) = x.dim();
        if h * w == 0 {
            return Err(MlErr::EmptyInput("pooling input"));
        }

        self.shape = Some((n, c, h, w));
        Ok(x.sum_axis(Axis(3)).sum_axis(Axis(2)) / (h * w) as f32)
    }

    fn backward(&mut self, _params: &mut BackIter, d: Array2<f32>) -> Result<Array4<f32>> {
        let shape = self.shape.take().ok_or(MlErr::NotForwarded("average pooling"))?;
        let area = (shape.2 * shape.3) as f32;

        let mut dx = Array4::zeros(shape);
        let d = d.insert_axis(Axis(2)).insert_axis(Axis(3));
        dx.zip_mut_with(&d, |o, &g| *o = g / area);

        Ok(dx)
    }
}
