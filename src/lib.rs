pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod model;
pub mod pipeline;
pub mod reference;
pub mod target;
pub mod training;

pub use error::{QuakeErr, Result};
