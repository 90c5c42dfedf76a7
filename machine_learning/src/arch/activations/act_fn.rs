use super::{Relu, Sigmoid, Silu};

/// An elementwise activation function.
#[derive(Debug, Clone)]
pub enum ActFn {
    Relu(Relu),
    Silu(Silu),
    Sigmoid(Sigmoid),
}

impl ActFn {
    pub fn relu() -> Self {
        Self::Relu(Relu)
    }

    pub fn silu() -> Self {
        Self::Silu(Silu)
    }

    pub fn sigmoid(amp: f32) -> Self {
        Self::Sigmoid(Sigmoid::new(amp))
    }

    pub fn f(&self, x: f32) -> f32 {
        match self {
            Self::Relu(a) => a.f(x),
            Self::Silu(a) => a.f(x),
            Self::Sigmoid(a) => a.f(x),
        }
    }

    /// The derivative, evaluated at the activation's input.
    pub fn df(&self, x: f32) -> f32 {
        match self {
            Self::Relu(a) => a.df(x),
            Self::Silu(a) => a.df(x),
            Self::Sigmoid(a) => a.df(x),
        }
    }
}
