pub mod config;
pub mod loss;
pub mod schedule;
pub mod trainer;

use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, SgdConfig};
use burn::tensor::backend::AutodiffBackend;

pub use config::{DatasetConfig, OptimizerKind, TrainingConfig};
pub use loss::{ReidLoss, ReidLossOutput, TripletLoss};
pub use schedule::WarmupStepLr;
pub use trainer::{StepLoss, Trainer, TrainingSummary};

use crate::error::{ReidError, ReidResult};
use crate::model::{PretrainChoice, StackPcb};

/// Load the splits, build the model and train it with the configured optimizer.
pub fn run<B: AutodiffBackend>(config: TrainingConfig, device: B::Device) -> ReidResult<TrainingSummary> {
    config.validate()?;

    let train = config.dataset.train()?.relabel();
    let query = config.dataset.query()?;
    let gallery = config.dataset.gallery()?;

    log::info!("Train:   {}", train.summary());
    log::info!("Query:   {}", query.summary());
    log::info!("Gallery: {}", gallery.summary());

    let mut config = config;
    if config.model.num_classes != train.num_pids() {
        log::warn!(
            "num_classes {} does not match the {} training identities; using the latter",
            config.model.num_classes,
            train.num_pids()
        );
        config.model.num_classes = train.num_pids();
    }

    let mut model = config.model.init::<B>(&device)?;
    if config.model.pretrain_choice == PretrainChoice::SelfTrained {
        let path = config
            .model
            .pretrain_path
            .clone()
            .ok_or_else(|| ReidError::MissingPretrainPath {
                choice: PretrainChoice::SelfTrained.to_string(),
            })?;
        model = model.load_param(&path, &device)?;
    }

    let policy = model.optim_policy();
    println!("model size: {:.5}M", policy.total as f64 / 1e6);
    log::info!("{} trainable / {} frozen parameters", policy.trainable(), policy.frozen);

    let weight_decay = Some(WeightDecayConfig::new(config.weight_decay as f32));
    match config.optim {
        OptimizerKind::Sgd => {
            let optimizer = SgdConfig::new()
                .with_momentum(Some(MomentumConfig::new().with_momentum(0.9).with_dampening(0.0)))
                .with_weight_decay(weight_decay)
                .init::<B, StackPcb<B>>();
            Trainer::new(model, optimizer, config, device).fit(&train, &query, &gallery)
        }
        OptimizerKind::Adam => {
            let optimizer = AdamConfig::new()
                .with_weight_decay(weight_decay)
                .init::<B, StackPcb<B>>();
            Trainer::new(model, optimizer, config, device).fit(&train, &query, &gallery)
        }
    }
}
