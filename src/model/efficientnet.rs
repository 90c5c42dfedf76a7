use machine_learning::{
    MlErr, Result,
    arch::{
        Mode, Module,
        layers::{Activation, BatchNorm2d, Conv2d, GlobalAvgPool, Layer, Sequential},
    },
    params::{BackIter, FrontIter, FrontIterMut},
    weights::WeightMap,
};
use ndarray::{Array2, Array4, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::join;

/// `(expand ratio, kernel, stride, in channels, out channels, repeats)` of every stage.
const STAGES: [(usize, usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 32, 16, 1),
    (6, 3, 2, 16, 24, 2),
    (6, 5, 2, 24, 40, 2),
    (6, 3, 2, 40, 80, 3),
    (6, 5, 1, 80, 112, 3),
    (6, 5, 2, 112, 192, 4),
    (6, 3, 1, 192, 320, 1),
];

const STEM_WIDTH: usize = 32;
const HEAD_WIDTH: usize = 1280;
const STOCHASTIC_DEPTH: f32 = 0.2;

/// A convolution followed by batch normalization and an optional activation, with the
/// padding that keeps the spatial size at stride 1.
fn conv_norm(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    groups: usize,
    act: Option<Activation>,
) -> Sequential {
    let mut layers: Vec<Layer> = vec![
        Conv2d::new(in_channels, out_channels, kernel)
            .stride(stride)
            .padding((kernel - 1) / 2)
            .groups(groups)
            .bias(false)
            .into(),
        BatchNorm2d::new(out_channels).into(),
    ];
    layers.extend(act.map(Layer::from));

    Sequential::new(layers)
}

/// Rescales every channel by a gate computed from the globally pooled input.
#[derive(Debug, Clone)]
struct SqueezeExcite {
    pool: GlobalAvgPool,
    fc1: Conv2d,
    act: Activation,
    fc2: Conv2d,
    gate: Activation,

    // Forward metadata: the input and its channel scales.
    cache: Option<(Array4<f32>, Array4<f32>)>,
}

impl SqueezeExcite {
    fn new(channels: usize, squeezed: usize) -> Self {
        Self {
            pool: GlobalAvgPool::new(),
            fc1: Conv2d::new(channels, squeezed, 1),
            act: Activation::silu(),
            fc2: Conv2d::new(squeezed, channels, 1),
            gate: Activation::sigmoid(),
            cache: None,
        }
    }
}

impl Module for SqueezeExcite {
    type Input = Array4<f32>;
    type Output = Array4<f32>;

    fn size(&self) -> usize {
        self.fc1.size() + self.fc2.size()
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> Result<()> {
        self.fc1.init(params, rng)?;
        self.fc2.init(params, rng)
    }

    fn forward(&mut self, params: &mut FrontIter, x: Array4<f32>, mode: Mode) -> Result<Array4<f32>> {
        let (n, c, _, _) = x.dim();

        let s = self.pool.forward(params, x.clone(), mode)?;
        let mut s = s.into_shape_with_order((n, c, 1, 1))?;
        s = self.fc1.forward(params, s, mode)?;
        s = self.act.forward(params, s, mode)?;
        s = self.fc2.forward(params, s, mode)?;
        let scale = self.gate.forward(params, s, mode)?;

        let y = &x * &scale;
        self.cache = Some((x, scale));
        Ok(y)
    }

    fn backward(&mut self, params: &mut BackIter, d: Array4<f32>) -> Result<Array4<f32>> {
        let (x, scale) = self.cache.take().ok_or(MlErr::NotForwarded("squeeze excitation"))?;
        let (n, c, _, _) = x.dim();

        let dscale = (&d * &x)
            .sum_axis(Axis(3))
            .sum_axis(Axis(2))
            .into_shape_with_order((n, c, 1, 1))?;
        let mut dx = &d * &scale;

        let mut ds = self.gate.backward(params, dscale)?;
        ds = self.fc2.backward(params, ds)?;
        ds = self.act.backward(params, ds)?;
        ds = self.fc1.backward(params, ds)?;

        let ds = ds.into_shape_with_order((n, c))?;
        dx += &self.pool.backward(params, ds)?;
        Ok(dx)
    }

    fn load(&mut self, params: &mut FrontIterMut, weights: &WeightMap, prefix: &str) -> Result<()> {
        self.fc1.load(params, weights, &join(prefix, "fc1"))?;
        self.fc2.load(params, weights, &join(prefix, "fc2"))
    }
}

/// An inverted residual block: 1x1 expansion, depthwise convolution, squeeze excitation and
/// a linear 1x1 projection. Blocks that keep their shape add their input back, dropping the
/// residual branch per sample while training.
#[derive(Debug, Clone)]
struct MbConv {
    expand: Option<Sequential>,
    depthwise: Sequential,
    se: SqueezeExcite,
    project: Sequential,
    residual: bool,
    drop_prob: f32,
    rng: StdRng,

    // Forward metadata: the per sample branch scale of the last training pass.
    mask: Option<Array4<f32>>,
}

impl MbConv {
    fn new(
        expand_ratio: usize,
        kernel: usize,
        stride: usize,
        in_channels: usize,
        out_channels: usize,
        drop_prob: f32,
        seed: u64,
    ) -> Self {
        let expanded = in_channels * expand_ratio;
        let expand = (expanded != in_channels)
            .then(|| conv_norm(in_channels, expanded, 1, 1, 1, Some(Activation::silu())));

        Self {
            expand,
            depthwise: conv_norm(expanded, expanded, kernel, stride, expanded, Some(Activation::silu())),
            se: SqueezeExcite::new(expanded, (in_channels / 4).max(1)),
            project: conv_norm(expanded, out_channels, 1, 1, 1, None),
            residual: stride == 1 && in_channels == out_channels,
            drop_prob,
            rng: StdRng::seed_from_u64(seed),
            mask: None,
        }
    }
}

impl Module for MbConv {
    type Input = Array4<f32>;
    type Output = Array4<f32>;

    fn size(&self) -> usize {
        self.expand.as_ref().map_or(0, |e| e.size())
            + self.depthwise.size()
            + self.se.size()
            + self.project.size()
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> Result<()> {
        if let Some(expand) = &self.expand {
            expand.init(params, rng)?;
        }
        self.depthwise.init(params, rng)?;
        self.se.init(params, rng)?;
        self.project.init(params, rng)
    }

    fn forward(&mut self, params: &mut FrontIter, x: Array4<f32>, mode: Mode) -> Result<Array4<f32>> {
        let skip = self.residual.then(|| x.clone());

        let mut h = x;
        if let Some(expand) = &mut self.expand {
            h = expand.forward(params, h, mode)?;
        }
        h = self.depthwise.forward(params, h, mode)?;
        h = self.se.forward(params, h, mode)?;
        h = self.project.forward(params, h, mode)?;

        self.mask = None;
        if let Some(skip) = skip {
            if mode == Mode::Train && self.drop_prob > 0. {
                let survival = 1. - self.drop_prob;
                let rng = &mut self.rng;
                let mask = Array4::from_shape_fn((h.dim().0, 1, 1, 1), |_| {
                    if rng.random::<f32>() < survival {
                        1. / survival
                    } else {
                        0.
                    }
                });

                h *= &mask;
                self.mask = Some(mask);
            }

            h += &skip;
        }

        Ok(h)
    }

    fn backward(&mut self, params: &mut BackIter, d: Array4<f32>) -> Result<Array4<f32>> {
        let (mut dh, d_skip) = if self.residual {
            let branch = match self.mask.take() {
                Some(mask) => &d * &mask,
                None => d.clone(),
            };
            (branch, Some(d))
        } else {
            (d, None)
        };

        dh = self.project.backward(params, dh)?;
        dh = self.se.backward(params, dh)?;
        dh = self.depthwise.backward(params, dh)?;
        if let Some(expand) = &mut self.expand {
            dh = expand.backward(params, dh)?;
        }

        if let Some(d_skip) = d_skip {
            dh += &d_skip;
        }

        Ok(dh)
    }

    /// Loads the block's layers from `{prefix}.block.{i}`, numbered as they're applied.
    fn load(&mut self, params: &mut FrontIterMut, weights: &WeightMap, prefix: &str) -> Result<()> {
        let mut i = 0;
        let mut next = || {
            let name = join(prefix, &format!("block.{i}"));
            i += 1;
            name
        };

        if let Some(expand) = &mut self.expand {
            expand.load(params, weights, &next())?;
        }
        self.depthwise.load(params, weights, &next())?;
        self.se.load(params, weights, &next())?;
        self.project.load(params, weights, &next())
    }

    fn buffer_size(&self) -> usize {
        self.expand.as_ref().map_or(0, |e| e.buffer_size())
            + self.depthwise.buffer_size()
            + self.project.buffer_size()
    }

    fn export_buffers(&self, out: &mut Vec<f32>) {
        if let Some(expand) = &self.expand {
            expand.export_buffers(out);
        }
        self.depthwise.export_buffers(out);
        self.project.export_buffers(out);
    }

    fn import_buffers(&mut self, src: &mut &[f32]) -> Result<()> {
        if let Some(expand) = &mut self.expand {
            expand.import_buffers(src)?;
        }
        self.depthwise.import_buffers(src)?;
        self.project.import_buffers(src)
    }
}

/// EfficientNet-B0 without its classifier, producing 1280 features per image.
///
/// Tensor names follow torchvision's `efficientnet_b0`: the stem is `features.0`, block `j`
/// of stage `s` is `features.{s + 1}.{j}` and the last 1x1 convolution is `features.8`.
#[derive(Debug, Clone)]
pub struct EfficientNetB0 {
    stem: Sequential,
    blocks: Vec<(String, MbConv)>,
    head: Sequential,
    avgpool: GlobalAvgPool,
}

impl EfficientNetB0 {
    /// Creates a new `EfficientNetB0`.
    ///
    /// # Arguments
    /// * `seed` - Seeds the stochastic depth of the residual blocks.
    pub fn new(seed: u64) -> Self {
        let total: usize = STAGES.iter().map(|stage| stage.5).sum();
        let mut blocks = Vec::with_capacity(total);

        for (s, &(expand, kernel, stride, in_channels, out_channels, repeats)) in
            STAGES.iter().enumerate()
        {
            for j in 0..repeats {
                let idx = blocks.len();
                let (stride, in_channels) = if j == 0 {
                    (stride, in_channels)
                } else {
                    (1, out_channels)
                };

                let drop_prob = STOCHASTIC_DEPTH * idx as f32 / total as f32;
                let block = MbConv::new(
                    expand,
                    kernel,
                    stride,
                    in_channels,
                    out_channels,
                    drop_prob,
                    seed.wrapping_add(idx as u64),
                );

                blocks.push((format!("features.{}.{j}", s + 1), block));
            }
        }

        let last = STAGES[STAGES.len() - 1].4;
        Self {
            stem: conv_norm(3, STEM_WIDTH, 3, 2, 1, Some(Activation::silu())),
            blocks,
            head: conv_norm(last, HEAD_WIDTH, 1, 1, 1, Some(Activation::silu())),
            avgpool: GlobalAvgPool::new(),
        }
    }
}

impl Module for EfficientNetB0 {
    type Input = Array4<f32>;
    type Output = Array2<f32>;

    fn size(&self) -> usize {
        self.stem.size()
            + self.blocks.iter().map(|(_, b)| b.size()).sum::<usize>()
            + self.head.size()
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> Result<()> {
        self.stem.init(params, rng)?;
        for (_, block) in &self.blocks {
            block.init(params, rng)?;
        }
        self.head.init(params, rng)
    }

    fn forward(&mut self, params: &mut FrontIter, x: Array4<f32>, mode: Mode) -> Result<Array2<f32>> {
        let mut h = self.stem.forward(params, x, mode)?;
        for (_, block) in self.blocks.iter_mut() {
            h = block.forward(params, h, mode)?;
        }
        h = self.head.forward(params, h, mode)?;

        self.avgpool.forward(params, h, mode)
    }

    fn backward(&mut self, params: &mut BackIter, d: Array2<f32>) -> Result<Array4<f32>> {
        let mut d = self.avgpool.backward(params, d)?;
        d = self.head.backward(params, d)?;
        for (_, block) in self.blocks.iter_mut().rev() {
            d = block.backward(params, d)?;
        }

        self.stem.backward(params, d)
    }

    fn load(&mut self, params: &mut FrontIterMut, weights: &WeightMap, prefix: &str) -> Result<()> {
        self.stem.load(params, weights, &join(prefix, "features.0"))?;
        for (name, block) in self.blocks.iter_mut() {
            block.load(params, weights, &join(prefix, name))?;
        }

        let head = format!("features.{}", STAGES.len() + 1);
        self.head.load(params, weights, &join(prefix, &head))
    }

    fn buffer_size(&self) -> usize {
        self.stem.buffer_size()
            + self.blocks.iter().map(|(_, b)| b.buffer_size()).sum::<usize>()
            + self.head.buffer_size()
    }

    fn export_buffers(&self, out: &mut Vec<f32>) {
        self.stem.export_buffers(out);
        for (_, block) in &self.blocks {
            block.export_buffers(out);
        }
        self.head.export_buffers(out);
    }

    fn import_buffers(&mut self, src: &mut &[f32]) -> Result<()> {
        self.stem.import_buffers(src)?;
        for (_, block) in self.blocks.iter_mut() {
            block.import_buffers(src)?;
        }
        self.head.import_buffers(src)
    }
}
