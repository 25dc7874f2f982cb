use burn::prelude::*;
use indicatif::{ProgressBar, ProgressStyle};

use crate::data::{ReidDataLoader, ReidDataset, TestView};
use crate::error::{ReidError, ReidResult};
use crate::evaluation::metrics::{Identity, RetrievalMetrics};
use crate::evaluation::rerank::ReRanking;
use crate::model::{NeckFeat, StackPcb};

#[derive(Debug, Clone)]
pub struct EvalSettings {
    /// Views whose features are summed per image.
    pub views: Vec<TestView>,
    /// L2-normalize the summed features.
    pub norm: bool,
    pub batch_size: usize,
    pub size: [usize; 2],
    /// Also score k-reciprocal re-ranked distances.
    pub re_ranking: Option<ReRanking>,
}

/// Metrics of one evaluation, plain and optionally re-ranked.
#[derive(Debug, Clone, Copy)]
pub struct EvalReport {
    pub metrics: RetrievalMetrics,
    pub re_ranked: Option<RetrievalMetrics>,
}

/// Runs the model in inference mode over a query and a gallery split.
pub struct Evaluator<B: Backend> {
    settings: EvalSettings,
    device: B::Device,
}

impl<B: Backend> Evaluator<B> {
    pub fn new(settings: EvalSettings, device: B::Device) -> Self {
        Self { settings, device }
    }

    pub fn evaluate(
        &self,
        model: &StackPcb<B>,
        query: &ReidDataset,
        gallery: &ReidDataset,
    ) -> ReidResult<EvalReport> {
        let (query_features, query_ids) = self.extract(model, query, "query")?;
        let (gallery_features, gallery_ids) = self.extract(model, gallery, "gallery")?;

        let distances: Vec<f32> =
            squared_distances(query_features.clone(), gallery_features.clone())
                .into_data()
                .iter::<f32>()
                .collect();

        let metrics = RetrievalMetrics::from_rankings(&distances, &query_ids, &gallery_ids);
        log::info!("{}", metrics);

        let re_ranked = self.settings.re_ranking.map(|params| {
            log::info!("Re-ranking {} queries", query_ids.len());
            let all = Tensor::cat(vec![query_features, gallery_features], 0);
            let all_distances: Vec<f32> = squared_distances(all.clone(), all)
                .into_data()
                .iter::<f32>()
                .collect();

            let distances = params.apply(&all_distances, query_ids.len());
            let metrics = RetrievalMetrics::from_rankings(&distances, &query_ids, &gallery_ids);
            log::info!("Re-ranked {}", metrics);
            metrics
        });

        Ok(EvalReport { metrics, re_ranked })
    }

    /// Features of every readable image, summed over the configured views.
    pub fn extract(
        &self,
        model: &StackPcb<B>,
        dataset: &ReidDataset,
        split: &str,
    ) -> ReidResult<(Tensor<B, 2>, Vec<Identity>)> {
        let empty = |msg: &str| ReidError::EmptySplit {
            split: split.to_string(),
            msg: msg.to_string(),
        };
        if self.settings.batch_size == 0 {
            return Err(ReidError::InvalidConfig("test batch size must be positive".into()));
        }
        if dataset.is_empty() {
            return Err(empty("no images"));
        }

        let mut summed: Option<Tensor<B, 2>> = None;
        let mut identities = Vec::new();

        for (i, view) in self.settings.views.iter().enumerate() {
            let loader = ReidDataLoader::<B>::test(
                dataset.clone(),
                *view,
                self.settings.batch_size,
                self.settings.size,
                self.device.clone(),
            );

            let pb = ProgressBar::new(loader.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            pb.set_message(format!("{split} ({view})"));

            let mut chunks = Vec::new();
            for batch in loader {
                if i == 0 {
                    identities.extend(
                        batch
                            .pids
                            .iter()
                            .zip(&batch.camids)
                            .map(|(&pid, &camid)| Identity { pid, camid }),
                    );
                }

                let features = model.forward_features(batch.images);
                chunks.push(match model.neck_feat() {
                    NeckFeat::After => features.embedding(),
                    NeckFeat::Before => features.raw_embedding(),
                });
                pb.inc(1);
            }
            pb.finish_and_clear();

            if chunks.is_empty() {
                return Err(empty("no readable images"));
            }

            let features = Tensor::cat(chunks, 0);
            summed = Some(match summed {
                Some(total) => total + features,
                None => features,
            });
        }

        let features = summed.ok_or_else(|| empty("no test views configured"))?;

        let features = if self.settings.norm {
            l2_normalize(features)
        } else {
            features
        };

        Ok((features, identities))
    }
}

pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norms = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
    x / norms
}

/// `||q||^2 + ||g||^2 - 2 q.g` for every query/gallery pair, `[Q, G]`.
pub fn squared_distances<B: Backend>(query: Tensor<B, 2>, gallery: Tensor<B, 2>) -> Tensor<B, 2> {
    let q_sq = query.clone().powf_scalar(2.0).sum_dim(1);
    let g_sq = gallery.clone().powf_scalar(2.0).sum_dim(1).transpose();
    let cross = query.matmul(gallery.transpose());

    (q_sq + g_sq - cross * 2.0).clamp_min(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn squared_distances_match_direct_computation() {
        let device = Default::default();
        let query = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0], [1.0, 2.0]], &device);
        let gallery = Tensor::<TestBackend, 2>::from_floats([[3.0, 4.0], [1.0, 2.0], [0.0, 1.0]], &device);

        let distances: Vec<f32> = squared_distances(query, gallery).into_data().iter::<f32>().collect();
        let expected = [25.0, 5.0, 1.0, 8.0, 0.0, 2.0];
        for (got, want) in distances.iter().zip(expected) {
            assert!((got - want).abs() < 1e-4, "{got} != {want}");
        }
    }

    #[test]
    fn rows_have_unit_norm() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_floats([[3.0, 4.0], [0.0, 2.0]], &device);

        let normalized: Vec<f32> = l2_normalize(x).into_data().iter::<f32>().collect();
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);
        assert!((normalized[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_split_is_reported_by_name() {
        use crate::model::{NeckMode, ResNetIbnConfig, StackPcbConfig};

        let device = Default::default();
        let mut config = StackPcbConfig::new(3, NeckMode::No, NeckFeat::After);
        config.local_dim = 4;
        config.last_stride = 1;
        config.resnet = ResNetIbnConfig {
            layers: [1, 1, 2, 1],
            base_width: 4,
        };
        let model: StackPcb<TestBackend> = config.init(&device).unwrap();

        let settings = EvalSettings {
            views: vec![TestView::Plain],
            norm: true,
            batch_size: 4,
            size: config.input_size(),
            re_ranking: None,
        };
        let evaluator = Evaluator::<TestBackend>::new(settings.clone(), Default::default());
        match evaluator.extract(&model, &ReidDataset::new(vec![]), "query") {
            Err(ReidError::EmptySplit { split, .. }) => assert_eq!(split, "query"),
            other => panic!("unexpected result: {:?}", other.map(|(_, ids)| ids.len())),
        }

        let no_views = Evaluator::<TestBackend>::new(
            EvalSettings {
                views: vec![],
                ..settings
            },
            Default::default(),
        );
        let one = ReidDataset::new(vec![crate::data::ReidSample {
            path: "missing.jpg".into(),
            pid: 1,
            camid: 0,
        }]);
        assert!(matches!(
            no_views.extract(&model, &one, "gallery"),
            Err(ReidError::EmptySplit { .. })
        ));
    }
}
