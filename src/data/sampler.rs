use std::collections::BTreeMap;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::data::dataset::ReidDataset;
use crate::error::{ReidError, ReidResult};

/// Draws `num_instances` images of every identity per epoch so each batch
/// holds `batch_size / num_instances` identities, as the triplet loss needs
/// positives and negatives in the same batch.
#[derive(Debug, Clone)]
pub struct RandomIdentitySampler {
    index_by_pid: BTreeMap<usize, Vec<usize>>,
    num_instances: usize,
}

impl RandomIdentitySampler {
    pub fn new(dataset: &ReidDataset, num_instances: usize) -> Self {
        assert!(num_instances > 0, "num_instances must be positive");

        let mut index_by_pid: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (index, sample) in dataset.samples().iter().enumerate() {
            index_by_pid.entry(sample.pid).or_default().push(index);
        }

        Self {
            index_by_pid,
            num_instances,
        }
    }

    pub fn num_instances(&self) -> usize {
        self.num_instances
    }

    pub fn num_pids(&self) -> usize {
        self.index_by_pid.len()
    }

    /// Indices yielded per epoch.
    pub fn len(&self) -> usize {
        self.num_pids() * self.num_instances
    }

    pub fn is_empty(&self) -> bool {
        self.index_by_pid.is_empty()
    }

    /// Check that one batch of `batch_size` can be filled with whole identities.
    pub fn check_batch(&self, batch_size: usize) -> ReidResult<()> {
        if batch_size == 0 || batch_size % self.num_instances != 0 {
            return Err(ReidError::InvalidBatch {
                batch_size,
                num_instances: self.num_instances,
            });
        }

        let needed = batch_size / self.num_instances;
        if self.num_pids() < needed {
            return Err(ReidError::TooFewIdentities {
                needed,
                found: self.num_pids(),
            });
        }
        Ok(())
    }

    /// One epoch of indices: identities in random order, `num_instances`
    /// consecutive images each. Identities with fewer images are drawn with
    /// replacement.
    pub fn epoch_indices<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        let mut pids: Vec<usize> = self.index_by_pid.keys().copied().collect();
        pids.shuffle(rng);

        let mut order = Vec::with_capacity(self.len());
        for pid in pids {
            let indices = &self.index_by_pid[&pid];
            if indices.len() >= self.num_instances {
                order.extend(indices.choose_multiple(rng, self.num_instances).copied());
            } else {
                order.extend((0..self.num_instances).map(|_| indices[rng.gen_range(0..indices.len())]));
            }
        }

        order
    }
}
