use machine_learning::{
    Result,
    arch::{
        Mode, Module,
        layers::{Activation, BatchNorm2d, Conv2d, GlobalAvgPool, MaxPool2d, Sequential},
    },
    params::{BackIter, FrontIter, FrontIterMut},
    weights::WeightMap,
};
use ndarray::{Array2, Array4};
use rand::Rng;

use super::join;

const WIDTHS: [usize; 4] = [64, 128, 256, 512];
const BLOCKS_PER_STAGE: usize = 2;

/// Two 3x3 convolutions with a residual connection, projected by a 1x1 convolution when
/// the stride or width changes.
#[derive(Debug, Clone)]
struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    relu: Activation,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    downsample: Option<Sequential>,
    relu_out: Activation,
}

impl BasicBlock {
    fn new(in_channels: usize, out_channels: usize, stride: usize) -> Self {
        let downsample = (stride != 1 || in_channels != out_channels).then(|| {
            Sequential::new([
                Conv2d::new(in_channels, out_channels, 1)
                    .stride(stride)
                    .bias(false)
                    .into(),
                BatchNorm2d::new(out_channels).into(),
            ])
        });

        Self {
            conv1: Conv2d::new(in_channels, out_channels, 3)
                .stride(stride)
                .padding(1)
                .bias(false),
            bn1: BatchNorm2d::new(out_channels),
            relu: Activation::relu(),
            conv2: Conv2d::new(out_channels, out_channels, 3)
                .padding(1)
                .bias(false),
            bn2: BatchNorm2d::new(out_channels),
            downsample,
            relu_out: Activation::relu(),
        }
    }
}

impl Module for BasicBlock {
    type Input = Array4<f32>;
    type Output = Array4<f32>;

    fn size(&self) -> usize {
        self.conv1.size()
            + self.bn1.size()
            + self.conv2.size()
            + self.bn2.size()
            + self.downsample.as_ref().map_or(0, |ds| ds.size())
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> Result<()> {
        self.conv1.init(params, rng)?;
        self.bn1.init(params, rng)?;
        self.conv2.init(params, rng)?;
        self.bn2.init(params, rng)?;
        if let Some(downsample) = &self.downsample {
            downsample.init(params, rng)?;
        }

        Ok(())
    }

    fn forward(&mut self, params: &mut FrontIter, x: Array4<f32>, mode: Mode) -> Result<Array4<f32>> {
        let mut h = self.conv1.forward(params, x.clone(), mode)?;
        h = self.bn1.forward(params, h, mode)?;
        h = self.relu.forward(params, h, mode)?;
        h = self.conv2.forward(params, h, mode)?;
        h = self.bn2.forward(params, h, mode)?;

        let identity = match &mut self.downsample {
            Some(downsample) => downsample.forward(params, x, mode)?,
            None => x,
        };

        h += &identity;
        self.relu_out.forward(params, h, mode)
    }

    fn backward(&mut self, params: &mut BackIter, d: Array4<f32>) -> Result<Array4<f32>> {
        let d = self.relu_out.backward(params, d)?;

        let d_identity = match &mut self.downsample {
            Some(downsample) => downsample.backward(params, d.clone())?,
            None => d.clone(),
        };

        let mut dx = self.bn2.backward(params, d)?;
        dx = self.conv2.backward(params, dx)?;
        dx = self.relu.backward(params, dx)?;
        dx = self.bn1.backward(params, dx)?;
        dx = self.conv1.backward(params, dx)?;

        dx += &d_identity;
        Ok(dx)
    }

    fn load(&mut self, params: &mut FrontIterMut, weights: &WeightMap, prefix: &str) -> Result<()> {
        self.conv1.load(params, weights, &join(prefix, "conv1"))?;
        self.bn1.load(params, weights, &join(prefix, "bn1"))?;
        self.conv2.load(params, weights, &join(prefix, "conv2"))?;
        self.bn2.load(params, weights, &join(prefix, "bn2"))?;
        if let Some(downsample) = &mut self.downsample {
            downsample.load(params, weights, &join(prefix, "downsample"))?;
        }

        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.bn1.buffer_size()
            + self.bn2.buffer_size()
            + self.downsample.as_ref().map_or(0, |ds| ds.buffer_size())
    }

    fn export_buffers(&self, out: &mut Vec<f32>) {
        self.bn1.export_buffers(out);
        self.bn2.export_buffers(out);
        if let Some(downsample) = &self.downsample {
            downsample.export_buffers(out);
        }
    }

    fn import_buffers(&mut self, src: &mut &[f32]) -> Result<()> {
        self.bn1.import_buffers(src)?;
        self.bn2.import_buffers(src)?;
        if let Some(downsample) = &mut self.downsample {
            downsample.import_buffers(src)?;
        }

        Ok(())
    }
}

/// ResNet-18 without its classifier, producing 512 features per image.
///
/// Tensor names follow torchvision's `resnet18`, so its published weights load as is.
#[derive(Debug, Clone)]
pub struct ResNet18 {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    relu: Activation,
    maxpool: MaxPool2d,
    blocks: Vec<BasicBlock>,
    avgpool: GlobalAvgPool,
}

impl ResNet18 {
    pub fn new() -> Self {
        let mut blocks = Vec::with_capacity(WIDTHS.len() * BLOCKS_PER_STAGE);
        let mut in_channels = WIDTHS[0];

        for (stage, &width) in WIDTHS.iter().enumerate() {
            for i in 0..BLOCKS_PER_STAGE {
                let stride = if stage > 0 && i == 0 { 2 } else { 1 };
                blocks.push(BasicBlock::new(in_channels, width, stride));
                in_channels = width;
            }
        }

        Self {
            conv1: Conv2d::new(3, WIDTHS[0], 7).stride(2).padding(3).bias(false),
            bn1: BatchNorm2d::new(WIDTHS[0]),
            relu: Activation::relu(),
            maxpool: MaxPool2d::new(3).stride(2).padding(1),
            blocks,
            avgpool: GlobalAvgPool::new(),
        }
    }

    /// The name of the `i`-th residual block, e.g. `layer3.1`.
    fn block_name(i: usize) -> String {
        format!("layer{}.{}", i / BLOCKS_PER_STAGE + 1, i % BLOCKS_PER_STAGE)
    }
}

impl Default for ResNet18 {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for ResNet18 {
    type Input = Array4<f32>;
    type Output = Array2<f32>;

    fn size(&self) -> usize {
        self.conv1.size() + self.bn1.size() + self.blocks.iter().map(|b| b.size()).sum::<usize>()
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> Result<()> {
        self.conv1.init(params, rng)?;
        self.bn1.init(params, rng)?;
        for block in &self.blocks {
            block.init(params, rng)?;
        }

        Ok(())
    }

    fn forward(&mut self, params: &mut FrontIter, x: Array4<f32>, mode: Mode) -> Result<Array2<f32>> {
        let mut h = self.conv1.forward(params, x, mode)?;
        h = self.bn1.forward(params, h, mode)?;
        h = self.relu.forward(params, h, mode)?;
        h = self.maxpool.forward(params, h, mode)?;

        for block in self.blocks.iter_mut() {
            h = block.forward(params, h, mode)?;
        }

        self.avgpool.forward(params, h, mode)
    }

    fn backward(&mut self, params: &mut BackIter, d: Array2<f32>) -> Result<Array4<f32>> {
        let mut d = self.avgpool.backward(params, d)?;

        for block in self.blocks.iter_mut().rev() {
            d = block.backward(params, d)?;
        }

        d = self.maxpool.backward(params, d)?;
        d = self.relu.backward(params, d)?;
        d = self.bn1.backward(params, d)?;
        self.conv1.backward(params, d)
    }

    fn load(&mut self, params: &mut FrontIterMut, weights: &WeightMap, prefix: &str) -> Result<()> {
        self.conv1.load(params, weights, &join(prefix, "conv1"))?;
        self.bn1.load(params, weights, &join(prefix, "bn1"))?;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.load(params, weights, &join(prefix, &Self::block_name(i)))?;
        }

        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.bn1.buffer_size() + self.blocks.iter().map(|b| b.buffer_size()).sum::<usize>()
    }

    fn export_buffers(&self, out: &mut Vec<f32>) {
        self.bn1.export_buffers(out);
        for block in &self.blocks {
            block.export_buffers(out);
        }
    }

    fn import_buffers(&mut self, src: &mut &[f32]) -> Result<()> {
        self.bn1.import_buffers(src)?;
        for block in self.blocks.iter_mut() {
            block.import_buffers(src)?;
        }

        Ok(())
    }
}
