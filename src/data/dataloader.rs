use burn::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::data::dataset::ReidDataset;
use crate::data::sampler::RandomIdentitySampler;
use crate::data::transforms::{TestView, TrainTransform, normalize_into};

/// How each image of a batch is prepared.
#[derive(Debug, Clone)]
pub enum Transform {
    Train(TrainTransform),
    Test { view: TestView, size: [usize; 2] },
}

impl Transform {
    fn size(&self) -> [usize; 2] {
        match self {
            Self::Train(train) => train.size,
            Self::Test { size, .. } => *size,
        }
    }
}

pub struct ReidBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    /// Training labels (relabelled pids).
    pub targets: Tensor<B, 1, Int>,
    pub pids: Vec<usize>,
    pub camids: Vec<usize>,
}

impl<B: Backend> ReidBatch<B> {
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

pub struct ReidDataLoader<B: Backend> {
    dataset: ReidDataset,
    order: Vec<usize>,
    batch_size: usize,
    drop_last: bool,
    transform: Transform,
    rng: StdRng,
    device: B::Device,
    current_idx: usize,
}

impl<B: Backend> ReidDataLoader<B> {
    /// Identity-balanced training loader for one epoch. Incomplete trailing
    /// batches are dropped.
    pub fn train(
        dataset: ReidDataset,
        sampler: &RandomIdentitySampler,
        batch_size: usize,
        size: [usize; 2],
        seed: u64,
        device: B::Device,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let order = sampler.epoch_indices(&mut rng);

        Self {
            dataset,
            order,
            batch_size,
            drop_last: true,
            transform: Transform::Train(TrainTransform::new(size)),
            rng,
            device,
            current_idx: 0,
        }
    }

    /// Sequential loader over the whole dataset for feature extraction.
    pub fn test(
        dataset: ReidDataset,
        view: TestView,
        batch_size: usize,
        size: [usize; 2],
        device: B::Device,
    ) -> Self {
        let order = (0..dataset.len()).collect();

        Self {
            dataset,
            order,
            batch_size,
            drop_last: false,
            transform: Transform::Test { view, size },
            rng: StdRng::seed_from_u64(0),
            device,
            current_idx: 0,
        }
    }

    pub fn len(&self) -> usize {
        if self.drop_last {
            self.order.len() / self.batch_size
        } else {
            self.order.len().div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B: Backend> Iterator for ReidDataLoader<B> {
    type Item = ReidBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let remaining = self.order.len().saturating_sub(self.current_idx);
            if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
                return None;
            }

            let end_idx = (self.current_idx + self.batch_size).min(self.order.len());
            let batch_indices = self.order[self.current_idx..end_idx].to_vec();
            self.current_idx = end_idx;

            let [height, width] = self.transform.size();
            let mut pixels = Vec::with_capacity(batch_indices.len() * 3 * height * width);
            let mut pids = Vec::with_capacity(batch_indices.len());
            let mut camids = Vec::with_capacity(batch_indices.len());

            for idx in batch_indices {
                let img = match self.dataset.load_image(idx) {
                    Ok(img) => img,
                    Err(e) => {
                        log::warn!("Skipping unreadable image: {}", e);
                        continue;
                    }
                };

                let rgb = match &self.transform {
                    Transform::Train(train) => train.apply(&img, &mut self.rng),
                    Transform::Test { view, size } => view.apply(&img, *size),
                };
                normalize_into(&rgb, &mut pixels);

                let sample = self.dataset.sample(idx);
                pids.push(sample.pid);
                camids.push(sample.camid);
            }

            if pids.is_empty() {
                continue;
            }

            let count = pids.len();
            let images =
                Tensor::<B, 4>::from_data(TensorData::new(pixels, [count, 3, height, width]), &self.device);
            let labels: Vec<i64> = pids.iter().map(|&pid| pid as i64).collect();
            let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [count]), &self.device);

            return Some(ReidBatch {
                images,
                targets,
                pids,
                camids,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::ReidSample;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray;

    fn write_dataset(dir: &std::path::Path, pids: &[usize]) -> ReidDataset {
        let samples = pids
            .iter()
            .enumerate()
            .map(|(i, &pid)| {
                let path = dir.join(format!("{i}.png"));
                RgbImage::from_pixel(8, 16, Rgb([i as u8 * 20, 0, 0]))
                    .save(&path)
                    .unwrap();
                ReidSample {
                    path,
                    pid,
                    camid: i % 2,
                }
            })
            .collect();
        ReidDataset::new(samples)
    }

    #[test]
    fn test_loader_keeps_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = write_dataset(dir.path(), &[0, 0, 1, 1, 2]);
        let loader =
            ReidDataLoader::<TestBackend>::test(dataset, TestView::Plain, 2, [16, 8], Default::default());

        assert_eq!(loader.len(), 3);
        let batches: Vec<_> = loader.collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].images.dims(), [1, 3, 16, 8]);
        assert_eq!(batches[2].pids, vec![2]);
    }

    #[test]
    fn train_loader_drops_incomplete_batches() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = write_dataset(dir.path(), &[0, 0, 1, 1, 2, 2]);
        let sampler = RandomIdentitySampler::new(&dataset, 2);
        let loader = ReidDataLoader::<TestBackend>::train(
            dataset,
            &sampler,
            4,
            [16, 8],
            7,
            Default::default(),
        );

        assert_eq!(loader.len(), 1);
        let batches: Vec<_> = loader.collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].targets.dims(), [4]);
        assert_eq!(batches[0].pids[0], batches[0].pids[1]);
    }

    #[test]
    fn unreadable_images_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut samples = write_dataset(dir.path(), &[0, 1]).samples().to_vec();
        samples.push(ReidSample {
            path: dir.path().join("missing.png"),
            pid: 9,
            camid: 0,
        });
        let loader = ReidDataLoader::<TestBackend>::test(
            ReidDataset::new(samples),
            TestView::Flip,
            8,
            [16, 8],
            Default::default(),
        );

        let batches: Vec<_> = loader.collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].pids, vec![0, 1]);
    }
}
