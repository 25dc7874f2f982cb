pub mod backbone;
pub mod blocks;
pub mod fork;
pub mod head;
pub mod neck;
pub mod parts;
pub mod stack_pcb;

pub use backbone::{Backbone, ResNetIbn, ResNetIbnConfig};
pub use fork::Fork;
pub use head::ClassifierBank;
pub use neck::{Neck, NeckMode};
pub use parts::{PartBranch, NUM_BRANCHES, NUM_LOCAL, STRIPES};
pub use stack_pcb::{
    NeckFeat, OptimPolicy, PartFeatures, PretrainChoice, ReidOutput, StackPcb, StackPcbConfig,
    StackPcbRecord,
};
