mod dataset;
mod loader;
mod transform;

pub use dataset::{ImageSet, Sample};
pub use loader::{Batch, Batches, DataLoader, TestBatch, TestBatches};
pub use transform::{IMAGENET_MEAN, IMAGENET_STD, load_image, preprocess};
