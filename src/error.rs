use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use machine_learning::MlErr;

use crate::target::Target;

/// The result type used in the entire crate.
pub type Result<T> = std::result::Result<T, QuakeErr>;

/// All errors that can occur while building, training or evaluating a model.
#[derive(Debug)]
pub enum QuakeErr {
    /// The backbone name isn't one of the supported variants.
    UnsupportedBackbone(String),
    /// The target name isn't one of `mag`, `dep`, `lon` or `lat`.
    UnsupportedTarget(String),
    /// Invalid configuration, caught before any work is done.
    InvalidConfig(String),
    /// The model uses auxiliary parameters but none were given.
    MissingAuxiliary,
    /// The auxiliary parameters have an unsupported width.
    AuxiliaryWidth { got: usize },
    /// Two inputs of the same batch disagree on its size.
    BatchMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// An identifier isn't present in the reference table.
    MissingReference { id: String, target: Target },
    /// A pass over a dataset didn't see a single sample.
    EmptyDataset(&'static str),
    /// A checkpoint doesn't match the model it's loaded into.
    Checkpoint(String),
    Ml(MlErr),
    Io(io::Error),
    Csv(csv::Error),
    Image(image::ImageError),
    Json(serde_json::Error),
}

impl Display for QuakeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedBackbone(name) => write!(f, "unsupported backbone: {name}"),
            Self::UnsupportedTarget(name) => write!(f, "unsupported target: {name}"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::MissingAuxiliary => {
                write!(f, "auxiliary parameters are required but were not provided")
            }
            Self::AuxiliaryWidth { got } => {
                write!(f, "auxiliary parameters must have width 2 or 3, got {got}")
            }
            Self::BatchMismatch {
                what,
                got,
                expected,
            } => write!(f, "batch size mismatch in {what}: got {got}, expected {expected}"),
            Self::MissingReference { id, target } => {
                write!(f, "no {target} reference value for '{id}'")
            }
            Self::EmptyDataset(what) => write!(f, "the {what} is empty"),
            Self::Checkpoint(msg) => write!(f, "checkpoint error: {msg}"),
            Self::Ml(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Csv(e) => write!(f, "csv error: {e}"),
            Self::Image(e) => write!(f, "image error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl Error for QuakeErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Ml(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Csv(e) => Some(e),
            Self::Image(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MlErr> for QuakeErr {
    fn from(e: MlErr) -> Self {
        Self::Ml(e)
    }
}

impl From<ndarray::ShapeError> for QuakeErr {
    fn from(e: ndarray::ShapeError) -> Self {
        Self::Ml(MlErr::Shape(e))
    }
}

impl From<io::Error> for QuakeErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<csv::Error> for QuakeErr {
    fn from(e: csv::Error) -> Self {
        Self::Csv(e)
    }
}

impl From<image::ImageError> for QuakeErr {
    fn from(e: image::ImageError) -> Self {
        Self::Image(e)
    }
}

impl From<serde_json::Error> for QuakeErr {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}
