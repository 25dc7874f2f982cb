pub mod bottleneck;
pub mod conv;
pub mod embedding;
pub mod ibn;

pub use bottleneck::{Bottleneck, EXPANSION};
pub use conv::ConvBn;
pub use embedding::LocalEmbedding;
pub use ibn::Ibn;
