use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

use super::conv::kaiming_fan_out;
use super::{ConvBn, Ibn};
use crate::model::fork::Fork;

pub const EXPANSION: usize = 4;

/// ResNet bottleneck whose first normalization is IBN-a on the shallow
/// stages and plain batch norm on the last one.
///
/// Field names follow the PyTorch `Bottleneck_IBN` state dict so ImageNet
/// weights load with a handful of key remaps (see `backbone`).
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: Option<BatchNorm<B, 2>>,
    pub ibn1: Option<Ibn<B>>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    pub conv3: Conv2d<B>,
    pub bn3: BatchNorm<B, 2>,
    pub downsample: Option<ConvBn<B>>,
}

impl<B: Backend> Bottleneck<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        planes: usize,
        stride: usize,
        ibn: bool,
    ) -> Self {
        let out_channels = planes * EXPANSION;
        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| ConvBn::new(device, in_channels, out_channels, stride));

        let (bn1, ibn1) = if ibn {
            (None, Some(Ibn::new(device, planes)))
        } else {
            (Some(BatchNormConfig::new(planes).init(device)), None)
        };

        Self {
            conv1: Conv2dConfig::new([in_channels, planes], [1, 1])
                .with_bias(false)
                .with_initializer(kaiming_fan_out())
                .init(device),
            bn1,
            ibn1,
            conv2: Conv2dConfig::new([planes, planes], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .with_initializer(kaiming_fan_out())
                .init(device),
            bn2: BatchNormConfig::new(planes).init(device),
            conv3: Conv2dConfig::new([planes, out_channels], [1, 1])
                .with_bias(false)
                .with_initializer(kaiming_fan_out())
                .init(device),
            bn3: BatchNormConfig::new(out_channels).init(device),
            downsample,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv1.forward(x.clone());
        let out = match (&self.ibn1, &self.bn1) {
            (Some(ibn), _) => ibn.forward(out),
            (None, Some(bn)) => bn.forward(out),
            (None, None) => out,
        };
        let out = relu(out);

        let out = relu(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));

        let residual = match &self.downsample {
            Some(downsample) => downsample.forward(x),
            None => x,
        };

        relu(out + residual)
    }
}

impl<B: Backend> Fork for Bottleneck<B> {
    fn deep_fork(&self) -> Self {
        Self {
            conv1: self.conv1.deep_fork(),
            bn1: self.bn1.deep_fork(),
            ibn1: self.ibn1.deep_fork(),
            conv2: self.conv2.deep_fork(),
            bn2: self.bn2.deep_fork(),
            conv3: self.conv3.deep_fork(),
            bn3: self.bn3.deep_fork(),
            downsample: self.downsample.deep_fork(),
        }
    }
}
