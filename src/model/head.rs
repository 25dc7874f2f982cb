use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::*;

/// A row of bias-free identity classifiers, one per embedding.
/// Only the training forward pass runs them.
#[derive(Module, Debug)]
pub struct ClassifierBank<B: Backend> {
    classifiers: Vec<Linear<B>>,
}

impl<B: Backend> ClassifierBank<B> {
    pub fn new(device: &B::Device, count: usize, in_features: usize, num_classes: usize) -> Self {
        assert!(num_classes > 0, "num_classes must be positive");

        // every iteration initializes a fresh layer
        let classifiers = (0..count)
            .map(|_| {
                LinearConfig::new(in_features, num_classes)
                    .with_bias(false)
                    .with_initializer(Initializer::Normal {
                        mean: 0.0,
                        std: 0.001,
                    })
                    .init(device)
            })
            .collect();

        Self { classifiers }
    }

    pub fn len(&self) -> usize {
        self.classifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classifiers.is_empty()
    }

    pub fn classifiers(&self) -> &[Linear<B>] {
        &self.classifiers
    }

    /// Pair the i-th embedding with the i-th classifier.
    pub fn forward(&self, features: &[Tensor<B, 2>]) -> Vec<Tensor<B, 2>> {
        assert_eq!(
            features.len(),
            self.classifiers.len(),
            "got {} embeddings for {} classifiers",
            features.len(),
            self.classifiers.len()
        );

        self.classifiers
            .iter()
            .zip(features)
            .map(|(classifier, feature)| classifier.forward(feature.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn classifiers_are_bias_free_and_independent() {
        let device = Default::default();
        let bank = ClassifierBank::<TestBackend>::new(&device, 3, 8, 5);

        assert_eq!(bank.len(), 3);
        assert!(bank.classifiers().iter().all(|c| c.bias.is_none()));
        assert_ne!(bank.classifiers()[0].weight.id, bank.classifiers()[1].weight.id);
        assert_ne!(bank.classifiers()[1].weight.id, bank.classifiers()[2].weight.id);
    }

    #[test]
    fn weights_are_small() {
        let device = Default::default();
        let bank = ClassifierBank::<TestBackend>::new(&device, 1, 64, 32);
        let weights: Vec<f32> = bank.classifiers()[0]
            .weight
            .val()
            .into_data()
            .to_vec()
            .unwrap();

        // std 0.001: nothing should come near 0.05
        assert!(weights.iter().all(|w| w.abs() < 0.05));
        assert!(weights.iter().any(|w| *w != 0.0));
    }

    #[test]
    fn logits_have_class_width() {
        let device = Default::default();
        let bank = ClassifierBank::<TestBackend>::new(&device, 2, 8, 5);
        let features = vec![Tensor::<TestBackend, 2>::ones([3, 8], &device); 2];

        let logits = bank.forward(&features);
        assert_eq!(logits.len(), 2);
        assert!(logits.iter().all(|l| l.dims() == [3, 5]));
    }
}
