use machine_learning::{
    Result,
    arch::{
        Mode, Module,
        layers::{Activation, Conv2d, GlobalAvgPool, MaxPool2d, Sequential},
    },
    params::{BackIter, FrontIter, FrontIterMut},
};
use ndarray::{Array2, Array4};
use rand::Rng;

/// A small three convolution network trained from scratch, producing 64 features per image.
#[derive(Debug, Clone)]
pub struct SimpleCnn {
    features: Sequential,
    avgpool: GlobalAvgPool,
}

impl SimpleCnn {
    pub fn new() -> Self {
        let features = Sequential::new([
            Conv2d::new(3, 16, 3).padding(1).into(),
            Activation::relu().into(),
            MaxPool2d::new(2).into(),
            Conv2d::new(16, 32, 3).padding(1).into(),
            Activation::relu().into(),
            MaxPool2d::new(2).into(),
            Conv2d::new(32, 64, 3).padding(1).into(),
            Activation::relu().into(),
        ]);

        Self {
            features,
            avgpool: GlobalAvgPool::new(),
        }
    }
}

impl Default for SimpleCnn {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for SimpleCnn {
    type Input = Array4<f32>;
    type Output = Array2<f32>;

    fn size(&self) -> usize {
        self.features.size()
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> Result<()> {
        self.features.init(params, rng)
    }

    fn forward(&mut self, params: &mut FrontIter, x: Array4<f32>, mode: Mode) -> Result<Array2<f32>> {
        let h = self.features.forward(params, x, mode)?;
        self.avgpool.forward(params, h, mode)
    }

    fn backward(&mut self, params: &mut BackIter, d: Array2<f32>) -> Result<Array4<f32>> {
        let d = self.avgpool.backward(params, d)?;
        self.features.backward(params, d)
    }
}

#[cfg(test)]
mod tests {
    use machine_learning::params::ParamStore;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn has_three_biased_convolutions() {
        let expected = (3 * 9 + 1) * 16 + (16 * 9 + 1) * 32 + (32 * 9 + 1) * 64;
        assert_eq!(SimpleCnn::new().size(), expected);
    }

    #[test]
    fn maps_any_image_size_to_64_features() {
        let mut model = SimpleCnn::new();
        let mut store = ParamStore::zeros(model.size());
        model
            .init(&mut store.front_mut(), &mut StdRng::seed_from_u64(0))
            .unwrap();

        for side in [8, 13, 32] {
            let x = Array4::from_elem((2, 3, side, side), 1.);
            let y = model.forward(&mut store.front(), x, Mode::Eval).unwrap();
            assert_eq!(y.dim(), (2, 64));
        }
    }

    #[test]
    fn backward_returns_image_gradients() {
        let mut model = SimpleCnn::new();
        let mut store = ParamStore::zeros(model.size());
        model
            .init(&mut store.front_mut(), &mut StdRng::seed_from_u64(1))
            .unwrap();

        let x = Array4::from_shape_fn((1, 3, 8, 8), |(_, c, y, x)| (c + y * x) as f32 * 0.1);
        model.forward(&mut store.front(), x, Mode::Train).unwrap();
        let dx = model.backward(&mut store.back(), Array2::ones((1, 64))).unwrap();

        assert_eq!(dx.dim(), (1, 3, 8, 8));
    }
}
