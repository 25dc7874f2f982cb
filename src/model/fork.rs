//! Deep copies with fresh parameter identities.
//!
//! Cloning a Burn module keeps every [`ParamId`] and shares the `Arc` behind
//! batch-norm running statistics, so a cloned branch would be updated as one
//! with its template. [`Fork`] copies the current values into new parameters
//! and new running-state cells instead.

use burn::module::{Param, ParamId, RunningState};
use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, InstanceNorm, Linear};
use burn::prelude::*;

/// Named apart from [`Module::fork`], which moves a module to a device and
/// keeps its parameter ids.
pub trait Fork {
    fn deep_fork(&self) -> Self;
}

pub(crate) fn fork_param<B: Backend, const D: usize>(
    param: &Param<Tensor<B, D>>,
) -> Param<Tensor<B, D>> {
    let require_grad = param.is_require_grad();
    Param::initialized(ParamId::new(), param.val().detach()).set_require_grad(require_grad)
}

fn fork_state<B: Backend>(state: &RunningState<Tensor<B, 1>>) -> RunningState<Tensor<B, 1>> {
    RunningState::new(state.value_sync())
}

impl<B: Backend> Fork for Conv2d<B> {
    fn deep_fork(&self) -> Self {
        let mut conv = self.clone();
        conv.weight = fork_param(&self.weight);
        conv.bias = self.bias.as_ref().map(fork_param);
        conv
    }
}

impl<B: Backend, const D: usize> Fork for BatchNorm<B, D> {
    fn deep_fork(&self) -> Self {
        let mut bn = self.clone();
        bn.gamma = fork_param(&self.gamma);
        bn.beta = fork_param(&self.beta);
        bn.running_mean = fork_state(&self.running_mean);
        bn.running_var = fork_state(&self.running_var);
        bn
    }
}

impl<B: Backend> Fork for InstanceNorm<B> {
    fn deep_fork(&self) -> Self {
        let mut norm = self.clone();
        norm.gamma = self.gamma.as_ref().map(fork_param);
        norm.beta = self.beta.as_ref().map(fork_param);
        norm
    }
}

impl<B: Backend> Fork for Linear<B> {
    fn deep_fork(&self) -> Self {
        let mut linear = self.clone();
        linear.weight = fork_param(&self.weight);
        linear.bias = self.bias.as_ref().map(fork_param);
        linear
    }
}

impl<T: Fork> Fork for Vec<T> {
    fn deep_fork(&self) -> Self {
        self.iter().map(Fork::deep_fork).collect()
    }
}

impl<T: Fork> Fork for Option<T> {
    fn deep_fork(&self) -> Self {
        self.as_ref().map(Fork::deep_fork)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{BatchNormConfig, LinearConfig};
    use burn::nn::conv::Conv2dConfig;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    #[test]
    fn forked_conv_gets_new_ids_and_same_values() {
        let device = Default::default();
        let conv: Conv2d<TestBackend> = Conv2dConfig::new([4, 8], [3, 3]).init(&device);
        let copy = conv.deep_fork();

        assert_ne!(conv.weight.id, copy.weight.id);
        let original: Vec<f32> = conv.weight.val().into_data().to_vec().unwrap();
        let forked: Vec<f32> = copy.weight.val().into_data().to_vec().unwrap();
        assert_eq!(original, forked);
    }

    #[test]
    fn deep_fork_differs_from_device_fork() {
        let device = Default::default();
        let linear: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);

        let moved = linear.clone().fork(&device);
        let copy = linear.deep_fork();

        assert_eq!(linear.weight.id, moved.weight.id);
        assert_ne!(linear.weight.id, copy.weight.id);
    }

    #[test]
    fn forked_batch_norm_keeps_frozen_shift() {
        let device = Default::default();
        let mut bn: BatchNorm<TestAutodiffBackend, 0> = BatchNormConfig::new(6).init(&device);
        bn.beta = bn.beta.set_require_grad(false);
        let copy = bn.deep_fork();

        assert_ne!(bn.gamma.id, copy.gamma.id);
        assert_ne!(bn.beta.id, copy.beta.id);
        assert!(copy.gamma.is_require_grad());
        assert!(!copy.beta.is_require_grad());
    }

    #[test]
    fn forked_batch_norm_running_stats_are_not_shared() {
        let device = Default::default();
        let bn: BatchNorm<TestAutodiffBackend, 0> = BatchNormConfig::new(2).init(&device);
        let copy = bn.deep_fork();

        let input =
            Tensor::<TestAutodiffBackend, 2>::from_floats([[4.0, -2.0], [6.0, 2.0]], &device);
        let _ = bn.forward(input);

        let moved: Vec<f32> = bn.running_mean.value_sync().into_data().to_vec().unwrap();
        let untouched: Vec<f32> = copy.running_mean.value_sync().into_data().to_vec().unwrap();
        assert!(moved[0] > 0.0);
        assert_eq!(untouched, vec![0.0, 0.0]);
    }
}
