use std::path::PathBuf;
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};

use crate::data::{RandomIdentitySampler, ReidBatch, ReidDataLoader, ReidDataset};
use crate::error::{ReidError, ReidResult};
use crate::evaluation::{EvalReport, EvalSettings, Evaluator, RetrievalMetrics};
use crate::model::{ReidOutput, StackPcb};
use crate::training::loss::ReidLoss;
use crate::training::schedule::WarmupStepLr;
use crate::training::TrainingConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct StepLoss {
    pub total: f32,
    pub id: f32,
    pub triplet: f32,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingSummary {
    pub best_rank1: f32,
    pub best_epoch: usize,
    pub last_metrics: Option<RetrievalMetrics>,
}

pub struct Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<StackPcb<B>, B>,
{
    pub model: StackPcb<B>,
    optimizer: O,
    loss_fn: ReidLoss<B>,
    schedule: WarmupStepLr,
    config: TrainingConfig,
    device: B::Device,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<StackPcb<B>, B>,
{
    pub fn new(model: StackPcb<B>, optimizer: O, config: TrainingConfig, device: B::Device) -> Self {
        let loss_fn = ReidLoss::new(
            &device,
            config.label_smoothing,
            config.margin,
            config.id_weight,
            config.triplet_weight,
        );

        let schedule = if config.adjust_lr {
            WarmupStepLr::new(
                config.lr,
                config.warmup_epochs,
                config.milestones.clone(),
                config.gamma,
            )
        } else {
            WarmupStepLr::constant(config.lr)
        };

        Self {
            model,
            optimizer,
            loss_fn,
            schedule,
            config,
            device,
        }
    }

    /// Forward, loss, backward and one optimizer step.
    pub fn train_step(&mut self, batch: ReidBatch<B>, lr: f64) -> StepLoss {
        let (logits, global_features) = match self.model.forward(batch.images) {
            ReidOutput::Train {
                logits,
                global_features,
            } => (logits, global_features),
            _ => unreachable!("autodiff backends always produce training outputs"),
        };

        let loss = self
            .loss_fn
            .forward(&logits, &global_features, batch.targets);

        let step = StepLoss {
            total: loss.total.clone().into_scalar().elem::<f32>(),
            id: loss.id.into_scalar().elem::<f32>(),
            triplet: loss.triplet.into_scalar().elem::<f32>(),
        };

        let grads = loss.total.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self.optimizer.step(lr, self.model.clone(), grads);

        step
    }

    pub fn fit(
        &mut self,
        train: &ReidDataset,
        query: &ReidDataset,
        gallery: &ReidDataset,
    ) -> ReidResult<TrainingSummary> {
        let sampler = RandomIdentitySampler::new(train, self.config.num_instances);
        sampler.check_batch(self.config.train_batch)?;

        let size = self.config.model.input_size();
        let mut summary = TrainingSummary::default();

        std::fs::create_dir_all(&self.config.save_dir)
            .map_err(|e| ReidError::io(&self.config.save_dir, e))?;

        for epoch in 1..=self.config.max_epoch {
            let epoch_start = Instant::now();
            let lr = self.schedule.lr(epoch);

            let loader = ReidDataLoader::<B>::train(
                train.clone(),
                &sampler,
                self.config.train_batch,
                size,
                self.config.seed.wrapping_add(epoch as u64),
                self.device.clone(),
            );

            let pb = ProgressBar::new(loader.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );

            let mut sum = StepLoss::default();
            let mut count = 0;
            for batch in loader {
                let step = self.train_step(batch, lr);
                if !step.total.is_finite() {
                    log::warn!("Non-finite loss at epoch {} batch {}", epoch, count + 1);
                }

                sum.total += step.total;
                sum.id += step.id;
                sum.triplet += step.triplet;
                count += 1;

                pb.set_message(format!("loss={:.4}", step.total));
                pb.inc(1);
            }
            pb.finish_and_clear();

            let n = count.max(1) as f32;
            log::info!(
                "Epoch [{}/{}] lr={:.2e} loss={:.4} (id={:.4}, triplet={:.4}) time={:.1}s",
                epoch,
                self.config.max_epoch,
                lr,
                sum.total / n,
                sum.id / n,
                sum.triplet / n,
                epoch_start.elapsed().as_secs_f32()
            );

            if self.config.evaluates_at(epoch) {
                let report = self.evaluate(query, gallery)?;
                let metrics = report.metrics;
                let is_best = metrics.rank1 > summary.best_rank1;
                if is_best {
                    summary.best_rank1 = metrics.rank1;
                    summary.best_epoch = epoch;
                }
                summary.last_metrics = Some(metrics);

                self.save_checkpoint(&format!("checkpoint_ep{epoch}"), epoch, &report)?;
                if is_best {
                    self.save_checkpoint("best", epoch, &report)?;
                }
            }
        }

        log::info!(
            "Best rank-1 {:.1}%, achieved at epoch {}",
            summary.best_rank1 * 100.0,
            summary.best_epoch
        );
        Ok(summary)
    }

    /// Best-checkpoint selection uses the plain rank-1.
    pub fn evaluate(&self, query: &ReidDataset, gallery: &ReidDataset) -> ReidResult<EvalReport> {
        let model = self.model.valid();
        let device = model.devices().into_iter().next().unwrap_or_default();

        let evaluator = Evaluator::<B::InnerBackend>::new(
            EvalSettings {
                views: self.config.test_views.clone(),
                norm: self.config.norm,
                batch_size: self.config.test_batch,
                size: self.config.model.input_size(),
                re_ranking: self.config.re_ranking_settings(),
            },
            device,
        );
        evaluator.evaluate(&model, query, gallery)
    }

    /// Write `<save_dir>/<name>/model.bin` and a `config.json` beside it.
    pub fn save_checkpoint(
        &self,
        name: &str,
        epoch: usize,
        report: &EvalReport,
    ) -> ReidResult<PathBuf> {
        let checkpoint_dir = self.config.save_dir.join(name);
        std::fs::create_dir_all(&checkpoint_dir).map_err(|e| ReidError::io(&checkpoint_dir, e))?;

        let model_path = checkpoint_dir.join("model");
        BinFileRecorder::<FullPrecisionSettings>::new()
            .record(self.model.clone().into_record(), model_path.clone())
            .map_err(|e| ReidError::Checkpoint {
                path: model_path.clone(),
                msg: format!("{e:?}"),
            })?;

        let config_path = checkpoint_dir.join("config.json");
        let config_json = serde_json::json!({
            "model_type": "StackPCBv2",
            "model": self.config.model,
            "epoch": epoch,
            "metrics": report.metrics,
            "re_ranked_metrics": report.re_ranked,
            "checkpoint_name": name,
        });
        std::fs::write(&config_path, serde_json::to_string_pretty(&config_json)?)
            .map_err(|e| ReidError::io(&config_path, e))?;

        log::info!("Saved checkpoint '{}' to {}", name, checkpoint_dir.display());
        Ok(model_path)
    }
}
