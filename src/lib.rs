pub mod data;
pub mod error;
pub mod evaluation;
pub mod model;
pub mod training;

// Re-exports for convenience
pub use data::{RandomIdentitySampler, ReidBatch, ReidDataLoader, ReidDataset, TestView};
pub use error::{ReidError, ReidResult};
pub use evaluation::{Evaluator, RetrievalMetrics};
pub use model::{NeckFeat, NeckMode, PretrainChoice, ReidOutput, StackPcb, StackPcbConfig};
pub use training::{Trainer, TrainingConfig, WarmupStepLr};
