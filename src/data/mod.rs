pub mod dataloader;
pub mod dataset;
pub mod sampler;
pub mod transforms;

pub use dataloader::{ReidBatch, ReidDataLoader, Transform};
pub use dataset::{ReidDataset, ReidSample};
pub use sampler::RandomIdentitySampler;
pub use transforms::{TestView, TrainTransform};
