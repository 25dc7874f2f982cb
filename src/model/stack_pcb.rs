use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use burn::module::{Ignored, ModuleVisitor, ParamId};
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::error::{ReidError, ReidResult};
use crate::model::backbone::{Backbone, ResNetIbnConfig};
use crate::model::blocks::LocalEmbedding;
use crate::model::fork::Fork;
use crate::model::head::ClassifierBank;
use crate::model::neck::{Neck, NeckMode};
use crate::model::parts::{NUM_BRANCHES, NUM_LOCAL, PART_MAP_SIZE, PartBranch};

/// Output stride of the trunk before `layer4`.
const TRUNK_STRIDE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PretrainChoice {
    /// Seed the trunk from a PyTorch ImageNet state dict.
    Imagenet,
    /// Resume from one of our own checkpoints through [`StackPcb::load_param`].
    #[serde(rename = "self")]
    SelfTrained,
    None,
}

impl FromStr for PretrainChoice {
    type Err = ReidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "imagenet" => Ok(Self::Imagenet),
            "self" => Ok(Self::SelfTrained),
            "none" => Ok(Self::None),
            other => Err(ReidError::UnknownPretrain(other.to_string())),
        }
    }
}

impl fmt::Display for PretrainChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Imagenet => write!(f, "imagenet"),
            Self::SelfTrained => write!(f, "self"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Which features the inference forward pass returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeckFeat {
    After,
    Before,
}

impl FromStr for NeckFeat {
    type Err = ReidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "after" => Ok(Self::After),
            "before" => Ok(Self::Before),
            other => Err(ReidError::UnknownNeckFeat(other.to_string())),
        }
    }
}

impl fmt::Display for NeckFeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::After => write!(f, "after"),
            Self::Before => write!(f, "before"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackPcbConfig {
    pub num_classes: usize,
    pub pretrain_choice: PretrainChoice,
    #[serde(default)]
    pub pretrain_path: Option<PathBuf>,
    pub neck: NeckMode,
    pub neck_feat: NeckFeat,
    #[serde(default = "default_local_dim")]
    pub local_dim: usize,
    #[serde(default = "default_last_stride")]
    pub last_stride: usize,
    #[serde(default)]
    pub resnet: ResNetIbnConfig,
}

fn default_local_dim() -> usize {
    256
}

fn default_last_stride() -> usize {
    2
}

impl Default for StackPcbConfig {
    fn default() -> Self {
        Self {
            num_classes: 751,
            pretrain_choice: PretrainChoice::None,
            pretrain_path: None,
            neck: NeckMode::BnNeck,
            neck_feat: NeckFeat::After,
            local_dim: default_local_dim(),
            last_stride: default_last_stride(),
            resnet: ResNetIbnConfig::default(),
        }
    }
}

impl StackPcbConfig {
    pub fn new(num_classes: usize, neck: NeckMode, neck_feat: NeckFeat) -> Self {
        Self {
            num_classes,
            neck,
            neck_feat,
            ..Self::default()
        }
    }

    /// `[H, W]` of the input images for which every branch map is 24x8.
    pub fn input_size(&self) -> [usize; 2] {
        let stride = TRUNK_STRIDE * self.last_stride;
        [PART_MAP_SIZE[0] * stride, PART_MAP_SIZE[1] * stride]
    }

    /// Width of the inference embedding: 5 globals plus 20 stripes.
    pub fn feature_dim(&self) -> usize {
        NUM_BRANCHES * self.resnet.out_channels() + NUM_LOCAL * self.local_dim
    }

    fn pretrain_path(&self) -> ReidResult<&Path> {
        self.pretrain_path
            .as_deref()
            .ok_or_else(|| ReidError::MissingPretrainPath {
                choice: self.pretrain_choice.to_string(),
            })
    }

    /// Build the model. With `pretrain_choice = imagenet` the trunk is loaded
    /// before the part branches are forked from it, so every branch starts
    /// from the pretrained `layer3[1..] + layer4`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ReidResult<StackPcb<B>> {
        assert!(self.local_dim > 0, "local_dim must be positive");
        assert!(
            self.last_stride == 1 || self.last_stride == 2,
            "last_stride must be 1 or 2, got {}",
            self.last_stride
        );

        let mut resnet = self.resnet.init::<B>(device, self.last_stride);
        if self.pretrain_choice == PretrainChoice::Imagenet {
            resnet = resnet.load_pytorch_weights(self.pretrain_path()?, device)?;
        }

        let global_dim = self.resnet.out_channels();
        let (backbone, layer3_tail, layer4) = resnet.split();
        let parts = PartBranch::from_template(&layer3_tail, &layer4);

        let template = LocalEmbedding::new(device, global_dim, self.local_dim);
        let local_embeddings = (0..NUM_LOCAL).map(|_| template.deep_fork()).collect();

        let model = StackPcb {
            backbone,
            parts,
            local_embeddings,
            neck: Neck::new(device, self.neck, self.local_dim, global_dim),
            local_classifiers: ClassifierBank::new(
                device,
                NUM_LOCAL,
                self.local_dim,
                self.num_classes,
            ),
            global_classifiers: ClassifierBank::new(
                device,
                NUM_BRANCHES,
                global_dim,
                self.num_classes,
            ),
            neck_feat: Ignored(self.neck_feat),
        };

        log::info!(
            "StackPCBv2: {} classes, neck={}, neck_feat={}, local_dim={}, input {:?}",
            self.num_classes,
            self.neck,
            self.neck_feat,
            self.local_dim,
            self.input_size()
        );

        Ok(model)
    }
}

/// Per-embedding features of one forward pass. Globals are ordered by
/// branch; locals branch-major, top stripe first.
#[derive(Debug, Clone)]
pub struct PartFeatures<B: Backend> {
    /// Raw flattened average pools, `[B, F]` each.
    pub global: Vec<Tensor<B, 2>>,
    /// Stripe embeddings before the neck, `[B, local_dim]` each.
    pub local: Vec<Tensor<B, 2>>,
    pub global_neck: Vec<Tensor<B, 2>>,
    pub local_neck: Vec<Tensor<B, 2>>,
}

impl<B: Backend> PartFeatures<B> {
    /// `cat([g1..g5, p1_f1..p5_f2], 1)` of the post-neck features.
    pub fn embedding(&self) -> Tensor<B, 2> {
        let parts: Vec<_> = self
            .global_neck
            .iter()
            .chain(self.local_neck.iter())
            .cloned()
            .collect();
        Tensor::cat(parts, 1)
    }

    /// Same layout as [`PartFeatures::embedding`] before the neck.
    pub fn raw_embedding(&self) -> Tensor<B, 2> {
        let parts: Vec<_> = self.global.iter().chain(self.local.iter()).cloned().collect();
        Tensor::cat(parts, 1)
    }
}

#[derive(Debug, Clone)]
pub enum ReidOutput<B: Backend> {
    /// Autodiff backend: 25 logits (5 global, then 20 local) and the 5 raw
    /// global features for the metric loss.
    Train {
        logits: Vec<Tensor<B, 2>>,
        global_features: Vec<Tensor<B, 2>>,
    },
    /// Inference with `neck_feat = after`.
    Embedding(Tensor<B, 2>),
    /// Inference with `neck_feat = before`.
    Empty,
}

impl<B: Backend> ReidOutput<B> {
    pub fn into_embedding(self) -> Option<Tensor<B, 2>> {
        match self {
            Self::Embedding(features) => Some(features),
            _ => None,
        }
    }
}

/// Parameter counts reported to the optimizer setup. Burn optimizers step the
/// whole module; the frozen neck shifts receive no gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimPolicy {
    pub total: usize,
    pub frozen: usize,
}

impl OptimPolicy {
    pub fn trainable(&self) -> usize {
        self.total - self.frozen
    }
}

#[derive(Module, Debug)]
pub struct StackPcb<B: Backend> {
    backbone: Backbone<B>,
    parts: Vec<PartBranch<B>>,
    local_embeddings: Vec<LocalEmbedding<B>>,
    neck: Neck<B>,
    local_classifiers: ClassifierBank<B>,
    global_classifiers: ClassifierBank<B>,
    neck_feat: Ignored<NeckFeat>,
}

impl<B: Backend> StackPcb<B> {
    pub fn forward_features(&self, images: Tensor<B, 4>) -> PartFeatures<B> {
        let x = self.backbone.forward(images);

        let mut global = Vec::with_capacity(NUM_BRANCHES);
        let mut stripes = Vec::with_capacity(NUM_LOCAL);
        for part in &self.parts {
            let map = part.forward(x.clone());
            // the map is exactly 24x8, so the global average is a plain mean
            global.push(map.clone().mean_dim(2).mean_dim(3).flatten(1, 3));
            stripes.extend(part.stripes_of(map));
        }

        let local: Vec<Tensor<B, 2>> = self
            .local_embeddings
            .iter()
            .zip(stripes)
            .map(|(embedding, stripe)| embedding.forward(stripe))
            .collect();

        let global_neck = self.neck.global(&global);
        let local_neck = self.neck.local(&local);

        PartFeatures {
            global,
            local,
            global_neck,
            local_neck,
        }
    }

    /// Training on an autodiff backend, inference otherwise (`model.valid()`).
    pub fn forward(&self, images: Tensor<B, 4>) -> ReidOutput<B> {
        let features = self.forward_features(images);

        if B::ad_enabled() {
            let mut logits = self.global_classifiers.forward(&features.global_neck);
            logits.extend(self.local_classifiers.forward(&features.local_neck));

            return ReidOutput::Train {
                logits,
                global_features: features.global,
            };
        }

        match *self.neck_feat {
            NeckFeat::After => ReidOutput::Embedding(features.embedding()),
            NeckFeat::Before => ReidOutput::Empty,
        }
    }

    /// Load a checkpoint written by the trainer, keeping the current
    /// classifiers. Lets a model trained on one identity set seed another.
    pub fn load_param(self, path: &Path, device: &B::Device) -> ReidResult<Self> {
        let mut record: StackPcbRecord<B> = BinFileRecorder::<FullPrecisionSettings>::new()
            .load(path.to_path_buf(), device)
            .map_err(|e| ReidError::Checkpoint {
                path: path.to_path_buf(),
                msg: format!("{e:?}"),
            })?;

        record.local_classifiers = self.local_classifiers.clone().into_record();
        record.global_classifiers = self.global_classifiers.clone().into_record();

        log::info!("Loaded parameters from {} (classifiers skipped)", path.display());
        Ok(self.load_record(record))
    }

    pub fn neck_feat(&self) -> NeckFeat {
        *self.neck_feat
    }

    pub fn neck(&self) -> &Neck<B> {
        &self.neck
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    pub fn parts(&self) -> &[PartBranch<B>] {
        &self.parts
    }

    pub fn local_embeddings(&self) -> &[LocalEmbedding<B>] {
        &self.local_embeddings
    }

    pub fn local_classifiers(&self) -> &ClassifierBank<B> {
        &self.local_classifiers
    }

    pub fn global_classifiers(&self) -> &ClassifierBank<B> {
        &self.global_classifiers
    }
}

impl<B: AutodiffBackend> StackPcb<B> {
    /// Learnable parameter counts. Batch-norm running statistics are
    /// buffers and are left out; the frozen bottleneck shifts are counted
    /// in `total` but never stepped.
    pub fn optim_policy(&self) -> OptimPolicy {
        let mut counter = TrainableCounter::default();
        self.visit(&mut counter);

        let frozen = self
            .neck
            .bottlenecks()
            .map(|b| b.local.beta.val().dims()[0] + b.global.beta.val().dims()[0])
            .unwrap_or(0);

        OptimPolicy {
            total: counter.trainable + frozen,
            frozen,
        }
    }
}

/// Sums the elements of tensors tracked by autodiff. Running statistics
/// are plain tensors and never tracked.
#[derive(Default)]
struct TrainableCounter {
    trainable: usize,
}

impl<B: Backend> ModuleVisitor<B> for TrainableCounter {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        if tensor.is_require_grad() {
            self.trainable += tensor.shape().num_elements();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_size_follows_last_stride() {
        let mut config = StackPcbConfig::default();
        config.last_stride = 1;
        assert_eq!(config.input_size(), [384, 128]);
        config.last_stride = 2;
        assert_eq!(config.input_size(), [768, 256]);
    }

    #[test]
    fn resnet50_feature_dim() {
        let config = StackPcbConfig::default();
        assert_eq!(config.feature_dim(), 5 * 2048 + 20 * 256);
    }

    #[test]
    fn imagenet_without_path_is_an_error() {
        let mut config = StackPcbConfig::default();
        config.pretrain_choice = PretrainChoice::Imagenet;
        assert!(matches!(
            config.pretrain_path(),
            Err(ReidError::MissingPretrainPath { .. })
        ));
    }

    #[test]
    fn choices_parse_from_strings() {
        assert_eq!("self".parse::<PretrainChoice>().unwrap(), PretrainChoice::SelfTrained);
        assert_eq!("before".parse::<NeckFeat>().unwrap(), NeckFeat::Before);
        assert!(matches!(
            "imagenet21k".parse::<PretrainChoice>(),
            Err(ReidError::UnknownPretrain(_))
        ));
        assert!(matches!("mid".parse::<NeckFeat>(), Err(ReidError::UnknownNeckFeat(_))));
    }

    #[test]
    fn config_yaml_uses_lowercase_names() {
        let yaml = "num_classes: 10\npretrain_choice: self\nneck: 'no'\nneck_feat: before\n";
        let config: StackPcbConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.pretrain_choice, PretrainChoice::SelfTrained);
        assert_eq!(config.neck, NeckMode::No);
        assert_eq!(config.local_dim, 256);
        assert_eq!(config.last_stride, 2);
    }
}
