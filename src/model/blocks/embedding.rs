use burn::nn::Initializer;
use burn::prelude::*;
use burn::tensor::activation::relu;

use super::ConvBn;
use crate::model::fork::Fork;

/// Stripe embedding head: 1x1 reduction, batch norm, ReLU, flatten.
/// Takes a pooled stripe `[B, C, 1, 1]` and returns `[B, local_dim]`.
#[derive(Module, Debug)]
pub struct LocalEmbedding<B: Backend> {
    reduction: ConvBn<B>,
}

impl<B: Backend> LocalEmbedding<B> {
    pub fn new(device: &B::Device, in_channels: usize, local_dim: usize) -> Self {
        Self {
            reduction: ConvBn::with_initializer(
                device,
                in_channels,
                local_dim,
                1,
                Initializer::KaimingUniform {
                    gain: 1.0 / 3f64.sqrt(),
                    fan_out_only: false,
                },
            ),
        }
    }

    pub fn forward(&self, stripe: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.reduction.forward(stripe));
        x.flatten(1, 3)
    }

    pub fn reduction(&self) -> &ConvBn<B> {
        &self.reduction
    }
}

impl<B: Backend> Fork for LocalEmbedding<B> {
    fn deep_fork(&self) -> Self {
        Self {
            reduction: self.reduction.deep_fork(),
        }
    }
}
