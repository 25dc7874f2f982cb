use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer};
use burn::prelude::*;

use crate::model::fork::Fork;

/// He-normal over fan-out, the ResNet convolution initialization.
pub(crate) fn kaiming_fan_out() -> Initializer {
    Initializer::KaimingNormal {
        gain: 2f64.sqrt(),
        fan_out_only: true,
    }
}

/// Bias-free 1x1 convolution followed by batch norm. Used for residual
/// downsampling and for the stripe embedding projection.
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBn<B> {
    pub fn new(device: &B::Device, in_channels: usize, out_channels: usize, stride: usize) -> Self {
        Self::with_initializer(device, in_channels, out_channels, stride, kaiming_fan_out())
    }

    pub fn with_initializer(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        initializer: Initializer,
    ) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .with_initializer(initializer)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        self.bn.forward(x)
    }
}

impl<B: Backend> Fork for ConvBn<B> {
    fn deep_fork(&self) -> Self {
        Self {
            conv: self.conv.deep_fork(),
            bn: self.bn.deep_fork(),
        }
    }
}
