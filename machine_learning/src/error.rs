use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use ndarray::ShapeError;
use safetensors::SafeTensorError;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    ParamsExhausted {
        requested: usize,
        remaining: usize,
    },
    NotForwarded(&'static str),
    EmptyInput(&'static str),
    InvalidDistribution(String),
    MissingTensor(String),
    TensorDtype {
        name: String,
        got: String,
    },
    TensorShape {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    Shape(ShapeError),
    SafeTensors(SafeTensorError),
    Io(io::Error),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => format!("There's a size mismatch in {what}, got {got} and expected {expected}"),
            MlErr::ParamsExhausted {
                requested,
                remaining,
            } => format!(
                "Tried to take {requested} parameters but only {remaining} are left in the buffer"
            ),
            MlErr::NotForwarded(layer) => {
                format!("Called backward on a {layer} layer without a previous forward pass")
            }
            MlErr::EmptyInput(what) => format!("The {what} is empty"),
            MlErr::InvalidDistribution(msg) => format!("Invalid parameter distribution: {msg}"),
            MlErr::MissingTensor(name) => format!("The tensor '{name}' is missing from the weights"),
            MlErr::TensorDtype { name, got } => {
                format!("The tensor '{name}' has dtype {got}, only F32 is supported")
            }
            MlErr::TensorShape {
                name,
                got,
                expected,
            } => format!("The tensor '{name}' has shape {got:?}, expected {expected:?}"),
            MlErr::Shape(e) => format!("Invalid array shape: {e}"),
            MlErr::SafeTensors(e) => format!("Invalid safetensors data: {e}"),
            MlErr::Io(e) => format!("I/O error: {e}"),
        };

        write!(f, "{s}")
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Shape(e) => Some(e),
            MlErr::SafeTensors(e) => Some(e),
            MlErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<SafeTensorError> for MlErr {
    fn from(value: SafeTensorError) -> Self {
        Self::SafeTensors(value)
    }
}

impl From<io::Error> for MlErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
