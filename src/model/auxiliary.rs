use machine_learning::{
    MlErr, Result,
    arch::{Mode, Module, activations::ActFn, layers::Dense},
    params::{BackIter, FrontIter, FrontIterMut},
};
use ndarray::Array2;
use rand::Rng;

/// The width of the auxiliary embedding.
pub const AUX_EMBEDDING: usize = 64;
const HIDDEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Narrow,
    Wide,
}

/// Embeds two or three auxiliary values per sample into `AUX_EMBEDDING` features.
///
/// Each input width has its own two layer path. Its parameters are the narrow path's
/// followed by the wide path's, a pass only touches the path matching its input.
#[derive(Debug, Clone)]
pub struct AuxiliaryEncoder {
    narrow: [Dense; 2],
    wide: [Dense; 2],

    // Forward metadata
    path: Option<Path>,
}

impl AuxiliaryEncoder {
    pub fn new() -> Self {
        let path = |width| {
            [
                Dense::new((width, HIDDEN), Some(ActFn::relu())),
                Dense::new((HIDDEN, AUX_EMBEDDING), Some(ActFn::relu())),
            ]
        };

        Self {
            narrow: path(2),
            wide: path(3),
            path: None,
        }
    }

    fn path_size(path: &[Dense; 2]) -> usize {
        path.iter().map(|layer| layer.size()).sum()
    }
}

impl Default for AuxiliaryEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for AuxiliaryEncoder {
    type Input = Array2<f32>;
    type Output = Array2<f32>;

    fn size(&self) -> usize {
        Self::path_size(&self.narrow) + Self::path_size(&self.wide)
    }

    fn init<R: Rng>(&self, params: &mut FrontIterMut, rng: &mut R) -> Result<()> {
        for layer in self.narrow.iter().chain(&self.wide) {
            layer.init(params, rng)?;
        }

        Ok(())
    }

    fn forward(&mut self, params: &mut FrontIter, x: Array2<f32>, mode: Mode) -> Result<Array2<f32>> {
        let (path, h) = match x.ncols() {
            2 => {
                let h = self.narrow[0].forward(params, x, mode)?;
                let h = self.narrow[1].forward(params, h, mode)?;
                params.take(Self::path_size(&self.wide))?;
                (Path::Narrow, h)
            }
            3 => {
                params.take(Self::path_size(&self.narrow))?;
                let h = self.wide[0].forward(params, x, mode)?;
                let h = self.wide[1].forward(params, h, mode)?;
                (Path::Wide, h)
            }
            got => {
                return Err(MlErr::SizeMismatch {
                    what: "auxiliary parameters width",
                    got,
                    expected: 2,
                });
            }
        };

        self.path = Some(path);
        Ok(h)
    }

    fn backward(&mut self, params: &mut BackIter, d: Array2<f32>) -> Result<Array2<f32>> {
        match self.path.take().ok_or(MlErr::NotForwarded("auxiliary encoder"))? {
            Path::Narrow => {
                params.take(Self::path_size(&self.wide))?;
                let d = self.narrow[1].backward(params, d)?;
                self.narrow[0].backward(params, d)
            }
            Path::Wide => {
                let d = self.wide[1].backward(params, d)?;
                let d = self.wide[0].backward(params, d)?;
                params.take(Self::path_size(&self.narrow))?;
                Ok(d)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use machine_learning::params::ParamStore;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn encoder() -> (AuxiliaryEncoder, ParamStore) {
        let encoder = AuxiliaryEncoder::new();
        let mut store = ParamStore::zeros(encoder.size());
        encoder
            .init(&mut store.front_mut(), &mut StdRng::seed_from_u64(9))
            .unwrap();
        (encoder, store)
    }

    #[test]
    fn size_covers_both_paths() {
        let narrow = 3 * 16 + 17 * 64;
        let wide = 4 * 16 + 17 * 64;
        assert_eq!(AuxiliaryEncoder::new().size(), narrow + wide);
    }

    #[test]
    fn both_widths_embed_to_64() {
        let (mut encoder, store) = encoder();

        for width in [2, 3] {
            let x = Array2::from_elem((5, width), 0.3);
            let y = encoder.forward(&mut store.front(), x, Mode::Eval).unwrap();
            assert_eq!(y.dim(), (5, AUX_EMBEDDING));
            assert!(y.iter().all(|&v| v >= 0.));
        }
    }

    #[test]
    fn other_widths_fail() {
        let (mut encoder, store) = encoder();
        let x = Array2::zeros((5, 4));
        assert!(encoder.forward(&mut store.front(), x, Mode::Eval).is_err());
    }

    #[test]
    fn backward_only_touches_the_used_path() {
        let (mut encoder, mut store) = encoder();
        let narrow = AuxiliaryEncoder::path_size(&encoder.narrow);

        let x = Array2::from_shape_fn((4, 3), |(i, j)| (i + j) as f32 * 0.5);
        encoder.forward(&mut store.front(), x, Mode::Train).unwrap();
        let dx = encoder.backward(&mut store.back(), Array2::ones((4, AUX_EMBEDDING))).unwrap();

        assert_eq!(dx.dim(), (4, 3));
        assert!(store.grad()[..narrow].iter().all(|&g| g == 0.));
        assert!(store.grad()[narrow..].iter().any(|&g| g != 0.));
    }
}
