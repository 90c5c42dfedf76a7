#[derive(Clone, Debug)]
pub struct Sigmoid {
    amp: f32,
}

impl Default for Sigmoid {
    fn default() -> Self {
        Self { amp: 1. }
    }
}

impl Sigmoid {
    pub fn new(amp: f32) -> Self {
        Self { amp }
    }

    pub fn f(&self, z: f32) -> f32 {
        self.amp / (1. + (-z).exp())
    }

    pub fn df(&self, z: f32) -> f32 {
        let e = (-z).exp();
        (self.amp * e) / (e + 1.).powi(2)
    }
}
