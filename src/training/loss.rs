use burn::nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Batch-hard triplet loss: for every anchor, the farthest positive and the
/// nearest negative in the batch.
#[derive(Debug, Clone)]
pub struct TripletLoss {
    margin: f32,
}

impl TripletLoss {
    pub fn new(margin: f32) -> Self {
        Self { margin }
    }

    pub fn forward<B: Backend>(&self, features: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let [n, _] = features.dims();
        let distances = euclidean_distances(features);

        let rows = targets.clone().reshape([n, 1]).expand([n, n]);
        let cols = targets.reshape([1, n]).expand([n, n]);
        let same = rows.equal(cols);

        let hardest_positive = distances
            .clone()
            .mask_fill(same.clone().bool_not(), 0.0)
            .max_dim(1);
        let hardest_negative = distances.mask_fill(same, 1e12).min_dim(1);

        relu(hardest_positive - hardest_negative + self.margin)
            .mean()
    }
}

fn euclidean_distances<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, _] = x.dims();
    let squared = x.clone().powf_scalar(2.0).sum_dim(1);
    let gram = x.clone().matmul(x.transpose());

    let squared_distances =
        squared.clone().expand([n, n]) + squared.transpose().expand([n, n]) - gram * 2.0;
    squared_distances.clamp_min(1e-12).sqrt()
}

/// Identity loss on all 25 logits plus metric loss on the 5 raw global features.
#[derive(Debug, Clone)]
pub struct ReidLoss<B: Backend> {
    cross_entropy: CrossEntropyLoss<B>,
    triplet: TripletLoss,
    id_weight: f32,
    triplet_weight: f32,
}

pub struct ReidLossOutput<B: Backend> {
    pub total: Tensor<B, 1>,
    pub id: Tensor<B, 1>,
    pub triplet: Tensor<B, 1>,
}

impl<B: Backend> ReidLoss<B> {
    pub fn new(
        device: &B::Device,
        label_smoothing: f32,
        margin: f32,
        id_weight: f32,
        triplet_weight: f32,
    ) -> Self {
        let smoothing = (label_smoothing > 0.0).then_some(label_smoothing);

        Self {
            cross_entropy: CrossEntropyLossConfig::new()
                .with_smoothing(smoothing)
                .init(device),
            triplet: TripletLoss::new(margin),
            id_weight,
            triplet_weight,
        }
    }

    pub fn forward(
        &self,
        logits: &[Tensor<B, 2>],
        global_features: &[Tensor<B, 2>],
        targets: Tensor<B, 1, Int>,
    ) -> ReidLossOutput<B> {
        assert!(!logits.is_empty() && !global_features.is_empty());

        let id = Tensor::cat(
            logits
                .iter()
                .map(|l| self.cross_entropy.forward(l.clone(), targets.clone()))
                .collect(),
            0,
        )
        .mean();
        let triplet = Tensor::cat(
            global_features
                .iter()
                .map(|f| self.triplet.forward(f.clone(), targets.clone()))
                .collect(),
            0,
        )
        .mean();

        ReidLossOutput {
            total: id.clone() * self.id_weight + triplet.clone() * self.triplet_weight,
            id,
            triplet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn triplet_is_zero_when_classes_are_far_apart() {
        let device = Default::default();
        let features = Tensor::<TestBackend, 2>::from_floats(
            [[0.0, 0.0], [0.1, 0.0], [10.0, 0.0], [10.1, 0.0]],
            &device,
        );
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 0, 1, 1], &device);

        let loss = TripletLoss::new(0.3).forward(features, targets);
        assert!(scalar(loss).abs() < 1e-6);
    }

    #[test]
    fn triplet_uses_hardest_pairs() {
        let device = Default::default();
        // anchor 0: hardest positive at 2.0, hardest negative at 1.0
        let features = Tensor::<TestBackend, 2>::from_floats([[0.0], [2.0], [1.0], [5.0]], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 0, 1, 1], &device);

        let loss = scalar(TripletLoss::new(0.5).forward(features, targets));
        // per anchor: relu(2-1+.5)=1.5, relu(2-1+.5)=1.5, relu(4-1+.5)=3.5, relu(4-3+.5)=1.5
        assert!((loss - 2.0).abs() < 1e-3, "{loss}");
    }

    #[test]
    fn id_loss_averages_over_logits() {
        let device = Default::default();
        let loss = ReidLoss::<TestBackend>::new(&device, 0.0, 0.3, 1.0, 0.0);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);
        let uniform = Tensor::<TestBackend, 2>::zeros([2, 4], &device);
        let features = Tensor::<TestBackend, 2>::zeros([2, 3], &device);

        let out = loss.forward(&[uniform.clone(), uniform], &[features], targets);
        // uniform logits over 4 classes: ln 4
        assert!((scalar(out.id) - 4f32.ln()).abs() < 1e-4);
        assert!((scalar(out.total) - 4f32.ln()).abs() < 1e-4);
    }
}
