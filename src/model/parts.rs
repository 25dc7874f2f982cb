use burn::prelude::*;

use crate::model::blocks::Bottleneck;
use crate::model::fork::Fork;

/// Stripes produced by each of the five branches, finest first.
pub const STRIPES: [usize; 5] = [6, 5, 4, 3, 2];
pub const NUM_BRANCHES: usize = STRIPES.len();
pub const NUM_LOCAL: usize = 20;
/// `[H', W']` of every branch feature map; the pooling kernels are sized for it.
pub const PART_MAP_SIZE: [usize; 2] = [24, 8];
/// Vertical stride of every local pool and growth of its kernel per branch.
pub const STRIPE_STEP: usize = 4;

/// Kernel height of the local max pool of `branch` (0-based): 4, 8, 12, 16, 20.
pub fn stripe_kernel_height(branch: usize) -> usize {
    STRIPE_STEP * (branch + 1)
}

/// One independently weighted continuation of the backbone
/// (`layer3[1..] + layer4`) with its local max pool.
#[derive(Module, Debug)]
pub struct PartBranch<B: Backend> {
    layer3: Vec<Bottleneck<B>>,
    layer4: Vec<Bottleneck<B>>,
    kernel_height: usize,
    stripes: usize,
}

impl<B: Backend> PartBranch<B> {
    /// Build the five branches as deep copies of the template layers.
    pub fn from_template(
        layer3_tail: &[Bottleneck<B>],
        layer4: &[Bottleneck<B>],
    ) -> Vec<Self> {
        (0..NUM_BRANCHES)
            .map(|branch| Self {
                layer3: layer3_tail.iter().map(Fork::deep_fork).collect(),
                layer4: layer4.iter().map(Fork::deep_fork).collect(),
                kernel_height: stripe_kernel_height(branch),
                stripes: STRIPES[branch],
            })
            .collect()
    }

    pub fn stripes(&self) -> usize {
        self.stripes
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        for block in self.layer3.iter().chain(self.layer4.iter()) {
            x = block.forward(x);
        }

        let [_, _, height, width] = x.dims();
        assert_eq!(
            [height, width],
            PART_MAP_SIZE,
            "branch feature map must be {:?}, got [{}, {}]; check the input size against last_stride",
            PART_MAP_SIZE,
            height,
            width
        );

        x
    }

    /// Max-pool the branch map with a `[kernel_height, W']` window at vertical
    /// stride 4 and return the `[B, C, 1, 1]` stripes, top to bottom.
    ///
    /// Each window is reduced with `max_dim`, whose backward pass holds for
    /// the non-square 24x8 map.
    pub fn stripes_of(&self, map: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let [batch, channels, height, width] = map.dims();
        let rows = (height - self.kernel_height) / STRIPE_STEP + 1;
        assert_eq!(
            rows, self.stripes,
            "pooled branch map has {} rows, expected {} stripes",
            rows, self.stripes
        );

        (0..rows)
            .map(|row| {
                let top = row * STRIPE_STEP;
                map.clone()
                    .slice([
                        0..batch,
                        0..channels,
                        top..top + self.kernel_height,
                        0..width,
                    ])
                    .max_dim(2)
                    .max_dim(3)
            })
            .collect()
    }

    /// Identity of the first convolution, distinct for every branch.
    pub fn first_conv_id(&self) -> Option<burn::module::ParamId> {
        self.layer3
            .iter()
            .chain(self.layer4.iter())
            .next()
            .map(|block| block.conv1.weight.id)
    }
}
