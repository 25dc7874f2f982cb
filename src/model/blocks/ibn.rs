use burn::nn::{BatchNorm, BatchNormConfig, InstanceNorm, InstanceNormConfig};
use burn::prelude::*;

use crate::model::fork::Fork;

/// Instance-batch normalization (IBN-a): the first half of the channels is
/// instance normalized, the rest batch normalized.
#[derive(Module, Debug)]
pub struct Ibn<B: Backend> {
    pub instance: InstanceNorm<B>,
    pub batch: BatchNorm<B, 2>,
    half: usize,
}

impl<B: Backend> Ibn<B> {
    pub fn new(device: &B::Device, planes: usize) -> Self {
        let half = planes / 2;

        Self {
            instance: InstanceNormConfig::new(half).with_affine(true).init(device),
            batch: BatchNormConfig::new(planes - half).init(device),
            half,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();

        let instance_half = x
            .clone()
            .slice([0..batch, 0..self.half, 0..height, 0..width]);
        let batch_half = x.slice([0..batch, self.half..channels, 0..height, 0..width]);

        Tensor::cat(
            vec![
                self.instance.forward(instance_half),
                self.batch.forward(batch_half),
            ],
            1,
        )
    }
}

impl<B: Backend> Fork for Ibn<B> {
    fn deep_fork(&self) -> Self {
        Self {
            instance: self.instance.deep_fork(),
            batch: self.batch.deep_fork(),
            half: self.half,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn splits_odd_channel_counts() {
        let device = Default::default();
        let ibn = Ibn::<TestBackend>::new(&device, 5);
        assert_eq!(ibn.half, 2);

        let x = Tensor::<TestBackend, 4>::random([2, 5, 3, 3], Distribution::Default, &device);
        assert_eq!(ibn.forward(x).dims(), [2, 5, 3, 3]);
    }

    #[test]
    fn instance_half_is_normalized_per_sample() {
        let device = Default::default();
        let ibn = Ibn::<TestBackend>::new(&device, 4);

        let x = Tensor::<TestBackend, 4>::random([1, 4, 4, 4], Distribution::Uniform(3.0, 9.0), &device);
        let out = ibn.forward(x);
        let mean = out
            .slice([0..1, 0..2, 0..4, 0..4])
            .mean()
            .into_scalar()
            .elem::<f32>();

        assert!(mean.abs() < 1e-4, "instance-normalized mean {mean}");
    }
}
