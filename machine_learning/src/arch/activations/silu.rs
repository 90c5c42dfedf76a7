/// Sigmoid linear unit, `z * sigmoid(z)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Silu;

impl Silu {
    pub fn f(&self, z: f32) -> f32 {
        z / (1. + (-z).exp())
    }

    pub fn df(&self, z: f32) -> f32 {
        let s = 1. / (1. + (-z).exp());
        s * (1. + z * (1. - s))
    }
}
