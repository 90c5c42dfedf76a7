use ndarray::{Array, Dimension, ShapeBuilder};
use ndarray_rand::{
    RandomExt,
    rand::{SeedableRng as _, rngs::StdRng as ArrayRng},
    rand_distr::Normal,
};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    arch::{Mode, Module},
    params::ParamStore,
};

const CHECKS: usize = 24;
const TOL: f64 = 2e-2;

/// Samples a standard normal array.
pub(crate) fn random_input<Sh, D>(shape: Sh, seed: u64) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
{
    let mut rng = ArrayRng::seed_from_u64(seed);
    Array::random_using(shape, Normal::new(0f32, 1f32).unwrap(), &mut rng)
}

fn indices(len: usize) -> Vec<usize> {
    let step = (len / CHECKS).max(1);
    (0..len).step_by(step).take(CHECKS).collect()
}

fn assert_close(what: &str, i: usize, numeric: f64, analytic: f64) {
    assert!(
        (numeric - analytic).abs() <= TOL * (1. + numeric.abs()),
        "{what}[{i}]: numeric {numeric} vs analytic {analytic}"
    );
}

/// Compares the gradients `module` computes, for both its parameters and its input, against
/// central finite differences of `sum(forward(x) * r)` for a fixed random `r`.
pub(crate) fn check<M, D1, D2>(mut module: M, x: Array<f32, D1>, mode: Mode, h: f32)
where
    M: Module<Input = Array<f32, D1>, Output = Array<f32, D2>>,
    D1: Dimension,
    D2: Dimension,
{
    let mut rng = StdRng::seed_from_u64(3);
    let mut store = ParamStore::zeros(module.size());
    module.init(&mut store.front_mut(), &mut rng).unwrap();

    // Moves batch norm scales and shifts away from their trivial initial values.
    let shifted: Vec<f32> = store
        .params()
        .iter()
        .map(|p| p + rng.random_range(-0.2..0.2))
        .collect();
    store.set_params(&shifted).unwrap();

    let y = module.forward(&mut store.front(), x.clone(), mode).unwrap();
    let r = y.mapv(|_| rng.random_range(-1f32..1f32));
    let dx = module.backward(&mut store.back(), r.clone()).unwrap();
    let grad = store.grad().to_vec();

    let mut objective = |store: &ParamStore, x: Array<f32, D1>| -> f64 {
        let y = module.forward(&mut store.front(), x, mode).unwrap();
        y.iter().zip(r.iter()).map(|(a, b)| *a as f64 * *b as f64).sum()
    };

    let base = store.params().to_vec();
    for i in indices(base.len()) {
        let mut p = base.clone();

        p[i] = base[i] + h;
        store.set_params(&p).unwrap();
        let plus = objective(&store, x.clone());

        p[i] = base[i] - h;
        store.set_params(&p).unwrap();
        let minus = objective(&store, x.clone());

        let numeric = (plus - minus) / (2. * h as f64);
        assert_close("param", i, numeric, grad[i] as f64);
    }
    store.set_params(&base).unwrap();

    let flat_dx: Vec<f32> = dx.iter().copied().collect();
    for i in indices(x.len()) {
        let mut plus_x = x.clone();
        let mut minus_x = x.clone();

        if let Some(v) = plus_x.iter_mut().nth(i) {
            *v += h;
        }
        if let Some(v) = minus_x.iter_mut().nth(i) {
            *v -= h;
        }

        let numeric = (objective(&store, plus_x) - objective(&store, minus_x)) / (2. * h as f64);
        assert_close("input", i, numeric, flat_dx[i] as f64);
    }
}
