pub mod evaluator;
pub mod metrics;
pub mod rerank;

pub use evaluator::{EvalReport, EvalSettings, Evaluator, l2_normalize, squared_distances};
pub use metrics::{Identity, RetrievalMetrics, evaluate_rankings};
pub use rerank::ReRanking;
