use std::path::PathBuf;
use thiserror::Error;

pub type ReidResult<T> = Result<T, ReidError>;

#[derive(Debug, Error)]
pub enum ReidError {
    #[error("unknown neck mode '{0}', expected 'no' or 'bnneck'")]
    UnknownNeck(String),
    #[error("unknown neck feature mode '{0}', expected 'after' or 'before'")]
    UnknownNeckFeat(String),
    #[error("unknown pretrain choice '{0}', expected 'imagenet', 'self' or 'none'")]
    UnknownPretrain(String),
    #[error("unknown optimizer '{0}', expected 'sgd' or 'adam'")]
    UnknownOptimizer(String),
    #[error("unknown test view '{0}'")]
    UnknownTestView(String),
    #[error("pretrain choice '{choice}' needs a weights path")]
    MissingPretrainPath { choice: String },
    #[error("checkpoint error at {path}: {msg}")]
    Checkpoint { path: PathBuf, msg: String },
    #[error("pytorch weights error at {path}: {msg}")]
    PretrainedWeights { path: PathBuf, msg: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("config error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("dataset error at {path}: {msg}")]
    Dataset { path: PathBuf, msg: String },
    #[error("sampler needs at least {needed} identities for a batch, found {found}")]
    TooFewIdentities { needed: usize, found: usize },
    #[error("batch size {batch_size} must be a positive multiple of num_instances {num_instances}")]
    InvalidBatch {
        batch_size: usize,
        num_instances: usize,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cannot evaluate the {split} split: {msg}")]
    EmptySplit { split: String, msg: String },
}

impl ReidError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn dataset(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Dataset {
            path: path.into(),
            msg: msg.into(),
        }
    }
}
