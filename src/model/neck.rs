use std::fmt;
use std::str::FromStr;

use burn::nn::{BatchNorm, BatchNormConfig};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ReidError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeckMode {
    /// Embeddings pass through unchanged.
    No,
    /// Shared batch-norm bottlenecks with a frozen shift.
    BnNeck,
}

impl FromStr for NeckMode {
    type Err = ReidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" => Ok(Self::No),
            "bnneck" => Ok(Self::BnNeck),
            other => Err(ReidError::UnknownNeck(other.to_string())),
        }
    }
}

impl fmt::Display for NeckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::No => write!(f, "no"),
            Self::BnNeck => write!(f, "bnneck"),
        }
    }
}

/// The two bottlenecks of `bnneck`: one instance for all 20 local
/// embeddings and one for all 5 global ones.
#[derive(Module, Debug)]
pub struct Bottlenecks<B: Backend> {
    pub local: BatchNorm<B, 0>,
    pub global: BatchNorm<B, 0>,
}

#[derive(Module, Debug)]
pub struct Neck<B: Backend> {
    bottlenecks: Option<Bottlenecks<B>>,
}

impl<B: Backend> Neck<B> {
    pub fn new(device: &B::Device, mode: NeckMode, local_dim: usize, global_dim: usize) -> Self {
        let bottlenecks = match mode {
            NeckMode::No => None,
            NeckMode::BnNeck => Some(Bottlenecks {
                local: frozen_shift(BatchNormConfig::new(local_dim).init(device)),
                global: frozen_shift(BatchNormConfig::new(global_dim).init(device)),
            }),
        };

        Self { bottlenecks }
    }

    pub fn mode(&self) -> NeckMode {
        match self.bottlenecks {
            Some(_) => NeckMode::BnNeck,
            None => NeckMode::No,
        }
    }

    pub fn bottlenecks(&self) -> Option<&Bottlenecks<B>> {
        self.bottlenecks.as_ref()
    }

    /// Normalize each global embedding separately through the shared global
    /// bottleneck, so its running statistics see five updates per batch.
    pub fn global(&self, features: &[Tensor<B, 2>]) -> Vec<Tensor<B, 2>> {
        match &self.bottlenecks {
            None => features.to_vec(),
            Some(bottlenecks) => features
                .iter()
                .map(|feature| bottlenecks.global.forward(feature.clone()))
                .collect(),
        }
    }

    /// Same as [`Neck::global`] for the 20 local embeddings.
    pub fn local(&self, features: &[Tensor<B, 2>]) -> Vec<Tensor<B, 2>> {
        match &self.bottlenecks {
            None => features.to_vec(),
            Some(bottlenecks) => features
                .iter()
                .map(|feature| bottlenecks.local.forward(feature.clone()))
                .collect(),
        }
    }
}

fn frozen_shift<B: Backend>(mut bn: BatchNorm<B, 0>) -> BatchNorm<B, 0> {
    bn.beta = bn.beta.set_require_grad(false);
    bn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_modes_only() {
        assert_eq!("no".parse::<NeckMode>().unwrap(), NeckMode::No);
        assert_eq!("bnneck".parse::<NeckMode>().unwrap(), NeckMode::BnNeck);
        assert!(matches!(
            "bn_neck".parse::<NeckMode>(),
            Err(ReidError::UnknownNeck(value)) if value == "bn_neck"
        ));
    }

    #[test]
    fn yaml_rejects_unknown_mode() {
        assert_eq!(serde_yaml::from_str::<NeckMode>("bnneck").unwrap(), NeckMode::BnNeck);
        assert!(serde_yaml::from_str::<NeckMode>("batchnorm").is_err());
    }
}
