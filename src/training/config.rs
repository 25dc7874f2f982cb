use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::data::{ReidDataset, TestView};
use crate::error::{ReidError, ReidResult};
use crate::evaluation::ReRanking;
use crate::model::StackPcbConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// SGD with momentum 0.9.
    Sgd,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = ReidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            other => Err(ReidError::UnknownOptimizer(other.to_string())),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sgd => write!(f, "sgd"),
            Self::Adam => write!(f, "adam"),
        }
    }
}

/// Where the three splits live. A missing list file means the matching
/// Market-1501 directory under `root` is scanned instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub train_list: Option<PathBuf>,
    #[serde(default)]
    pub query_list: Option<PathBuf>,
    #[serde(default)]
    pub gallery_list: Option<PathBuf>,
}

impl DatasetConfig {
    pub fn train(&self) -> ReidResult<ReidDataset> {
        self.load(self.train_list.as_deref(), "bounding_box_train")
    }

    pub fn query(&self) -> ReidResult<ReidDataset> {
        self.load(self.query_list.as_deref(), "query")
    }

    pub fn gallery(&self) -> ReidResult<ReidDataset> {
        self.load(self.gallery_list.as_deref(), "bounding_box_test")
    }

    fn load(&self, list: Option<&Path>, market_dir: &str) -> ReidResult<ReidDataset> {
        match list {
            Some(list) => ReidDataset::from_list(&self.root, self.root.join(list)),
            None => ReidDataset::from_market1501(self.root.join(market_dir)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    // Data
    pub dataset: DatasetConfig,
    pub train_batch: usize,
    pub test_batch: usize,
    pub num_instances: usize,

    // Optimization
    pub optim: OptimizerKind,
    pub lr: f64,
    pub weight_decay: f64,
    pub max_epoch: usize,
    pub adjust_lr: bool,
    pub warmup_epochs: usize,
    pub milestones: Vec<usize>,
    pub gamma: f64,

    // Loss
    pub label_smoothing: f32,
    pub margin: f32,
    pub id_weight: f32,
    pub triplet_weight: f32,

    // Evaluation
    pub eval_step: usize,
    pub norm: bool,
    pub test_views: Vec<TestView>,
    /// Report k-reciprocal re-ranked metrics next to the plain ones.
    #[serde(default)]
    pub re_ranking: bool,
    #[serde(default)]
    pub re_ranking_params: ReRanking,

    // Checkpointing
    pub save_dir: PathBuf,
    pub seed: u64,

    pub model: StackPcbConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetConfig {
                root: PathBuf::from("data/market1501"),
                train_list: None,
                query_list: None,
                gallery_list: None,
            },
            train_batch: 32,
            test_batch: 32,
            num_instances: 4,
            optim: OptimizerKind::Sgd,
            lr: 0.01,
            weight_decay: 5e-4,
            max_epoch: 120,
            adjust_lr: true,
            warmup_epochs: 10,
            milestones: vec![40, 70],
            gamma: 0.1,
            label_smoothing: 0.1,
            margin: 0.3,
            id_weight: 1.0,
            triplet_weight: 1.0,
            eval_step: 10,
            norm: true,
            test_views: vec![TestView::Plain, TestView::Flip],
            re_ranking: true,
            re_ranking_params: ReRanking::default(),
            save_dir: PathBuf::from("runs/stack_pcb"),
            seed: 0,
            model: StackPcbConfig::default(),
        }
    }
}

impl TrainingConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> ReidResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ReidError::io(path, e))?;
        let config: TrainingConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> ReidResult<()> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).map_err(|e| ReidError::io(path, e))?;
        Ok(())
    }

    /// Reject batch settings the sampler and loaders cannot serve.
    pub fn validate(&self) -> ReidResult<()> {
        if self.num_instances == 0 {
            return Err(ReidError::InvalidConfig("num_instances must be positive".into()));
        }
        if self.train_batch == 0 || self.train_batch % self.num_instances != 0 {
            return Err(ReidError::InvalidBatch {
                batch_size: self.train_batch,
                num_instances: self.num_instances,
            });
        }
        if self.test_batch == 0 {
            return Err(ReidError::InvalidConfig("test_batch must be positive".into()));
        }
        if self.test_views.is_empty() {
            return Err(ReidError::InvalidConfig("test_views is empty".into()));
        }
        Ok(())
    }

    pub fn re_ranking_settings(&self) -> Option<ReRanking> {
        self.re_ranking.then_some(self.re_ranking_params)
    }

    /// Whether epoch `epoch` (1-based) ends with an evaluation.
    pub fn evaluates_at(&self, epoch: usize) -> bool {
        (self.eval_step > 0 && epoch % self.eval_step == 0) || epoch == self.max_epoch
    }
}
