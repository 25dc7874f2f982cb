use std::path::Path;

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, Recorder};
use burn::tensor::activation::relu;
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use serde::{Deserialize, Serialize};

use crate::error::{ReidError, ReidResult};
use crate::model::blocks::conv::kaiming_fan_out;
use crate::model::blocks::{Bottleneck, EXPANSION};

/// Depths and width of the IBN-a ResNet trunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResNetIbnConfig {
    pub layers: [usize; 4],
    pub base_width: usize,
}

impl Default for ResNetIbnConfig {
    /// ResNet-50.
    fn default() -> Self {
        Self {
            layers: [3, 4, 6, 3],
            base_width: 64,
        }
    }
}

impl ResNetIbnConfig {
    /// Channel count of the last stage (2048 for ResNet-50).
    pub fn out_channels(&self) -> usize {
        self.base_width * 8 * EXPANSION
    }

    pub fn init<B: Backend>(&self, device: &B::Device, last_stride: usize) -> ResNetIbn<B> {
        assert!(
            self.layers.iter().all(|&depth| depth > 0),
            "every ResNet stage needs at least one block, got {:?}",
            self.layers
        );
        assert!(self.base_width >= 2, "base_width must be at least 2");

        let width = self.base_width;
        let mut in_channels = width;

        let conv1 = Conv2dConfig::new([3, width], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .with_initializer(kaiming_fan_out())
            .init(device);
        let bn1 = BatchNormConfig::new(width).init(device);

        // IBN on every stage except the last
        let layer1 = make_layer(device, &mut in_channels, width, self.layers[0], 1, true);
        let layer2 = make_layer(device, &mut in_channels, width * 2, self.layers[1], 2, true);
        let layer3 = make_layer(device, &mut in_channels, width * 4, self.layers[2], 2, true);
        let layer4 = make_layer(
            device,
            &mut in_channels,
            width * 8,
            self.layers[3],
            last_stride,
            false,
        );

        ResNetIbn {
            conv1,
            bn1,
            layer1,
            layer2,
            layer3,
            layer4,
        }
    }
}

fn make_layer<B: Backend>(
    device: &B::Device,
    in_channels: &mut usize,
    planes: usize,
    blocks: usize,
    stride: usize,
    ibn: bool,
) -> Vec<Bottleneck<B>> {
    let mut layer = Vec::with_capacity(blocks);
    layer.push(Bottleneck::new(device, *in_channels, planes, stride, ibn));
    *in_channels = planes * EXPANSION;

    for _ in 1..blocks {
        layer.push(Bottleneck::new(device, *in_channels, planes, 1, ibn));
    }

    layer
}

/// Full IBN-a ResNet without its ImageNet classifier. Only exists during
/// construction: it is split into the shared [`Backbone`] and the part-branch
/// template right after the optional weight load.
#[derive(Module, Debug)]
pub struct ResNetIbn<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub layer1: Vec<Bottleneck<B>>,
    pub layer2: Vec<Bottleneck<B>>,
    pub layer3: Vec<Bottleneck<B>>,
    pub layer4: Vec<Bottleneck<B>>,
}

impl<B: Backend> ResNetIbn<B> {
    /// Load ImageNet weights from a PyTorch `resnet50_ibn_a` state dict.
    /// The `fc.*` classifier entries have no counterpart here and are skipped.
    pub fn load_pytorch_weights(self, path: &Path, device: &B::Device) -> ReidResult<Self> {
        let load_args = LoadArgs::new(path.to_path_buf())
            .with_key_remap(r"^module\.", "")
            .with_key_remap(r"\.bn1\.IN\.weight$", ".ibn1.instance.gamma")
            .with_key_remap(r"\.bn1\.IN\.bias$", ".ibn1.instance.beta")
            .with_key_remap(r"\.bn1\.BN\.", ".ibn1.batch.")
            .with_key_remap(r"downsample\.0", "downsample.conv")
            .with_key_remap(r"downsample\.1", "downsample.bn");

        let record: ResNetIbnRecord<B> = PyTorchFileRecorder::<FullPrecisionSettings>::new()
            .load(load_args, device)
            .map_err(|e| ReidError::PretrainedWeights {
                path: path.to_path_buf(),
                msg: format!("{e:?}"),
            })?;

        log::info!("Loaded pretrained ImageNet weights from {}", path.display());
        Ok(self.load_record(record))
    }

    /// Split at `layer3[0]`: everything up to it is shared, `layer3[1..]` and
    /// `layer4` become the part-branch template.
    pub fn split(self) -> (Backbone<B>, Vec<Bottleneck<B>>, Vec<Bottleneck<B>>) {
        let mut layer3 = self.layer3;
        let layer3_tail = layer3.split_off(1);
        let layer3_head = layer3;

        let backbone = Backbone {
            conv1: self.conv1,
            bn1: self.bn1,
            layer1: self.layer1,
            layer2: self.layer2,
            layer3_head,
        };

        (backbone, layer3_tail, self.layer4)
    }
}

/// Shared trunk: `conv1, bn1, relu, maxpool, layer1, layer2, layer3[0]`.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    layer1: Vec<Bottleneck<B>>,
    layer2: Vec<Bottleneck<B>>,
    layer3_head: Vec<Bottleneck<B>>,
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.bn1.forward(self.conv1.forward(x)));
        let mut x = stem_max_pool(x);

        for block in self
            .layer1
            .iter()
            .chain(self.layer2.iter())
            .chain(self.layer3_head.iter())
        {
            x = block.forward(x);
        }

        x
    }

    pub fn first_conv_id(&self) -> burn::module::ParamId {
        self.conv1.weight.id
    }
}

/// 3x3 max pool with stride 2 and padding 1, taken as the max of nine
/// strided views. Its backward pass holds for the non-square stem map.
pub fn stem_max_pool<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, channels, height, width] = x.dims();
    let out_h = (height - 1) / 2 + 1;
    let out_w = (width - 1) / 2 + 1;

    // every shifted view needs 2 * out + 2 padded rows and columns
    let padded = x.pad(
        (1, 2 * out_w + 1 - width, 1, 2 * out_h + 1 - height),
        f32::NEG_INFINITY,
    );

    let view = |dy: usize, dx: usize| {
        padded
            .clone()
            .slice([0..batch, 0..channels, dy..dy + 2 * out_h, dx..dx + 2 * out_w])
            .reshape([batch, channels, out_h, 2, out_w, 2])
            .slice([0..batch, 0..channels, 0..out_h, 0..1, 0..out_w, 0..1])
            .reshape([batch, channels, out_h, out_w])
    };

    (0..3)
        .flat_map(|dy| (0..3).map(move |dx| (dy, dx)))
        .skip(1)
        .fold(view(0, 0), |pooled, (dy, dx)| pooled.max_pair(view(dy, dx)))
}


#[cfg(test)]
mod stem_pool_tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::pool::MaxPool2dConfig;
    use burn::tensor::Distribution;

    #[test]
    fn matches_max_pool_forward() {
        let device = Default::default();
        let reference = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        for [height, width] in [[12, 4], [7, 5], [8, 8]] {
            let x = Tensor::<NdArray, 4>::random([2, 3, height, width], Distribution::Default, &device);
            let expected: Vec<f32> = reference.forward(x.clone()).into_data().to_vec().unwrap();
            let pooled = stem_max_pool(x);
            assert_eq!(pooled.dims(), [2, 3, (height + 1) / 2, (width + 1) / 2]);
            let actual: Vec<f32> = pooled.into_data().to_vec().unwrap();
            assert_eq!(actual, expected, "{height}x{width}");
        }
    }

    #[test]
    fn backward_on_non_square_map() {
        let device = Default::default();
        let x = Tensor::<Autodiff<NdArray>, 4>::random([1, 2, 12, 4], Distribution::Default, &device)
            .require_grad();

        let grads = stem_max_pool(x.clone()).sum().backward();
        let grad = x.grad(&grads).unwrap();

        assert_eq!(grad.dims(), [1, 2, 12, 4]);
        // one winner per output cell: 6 * 2 cells in each of the 2 channels
        assert_eq!(grad.sum().into_scalar(), 24.0);
    }
}
