use std::fmt;

use serde::{Deserialize, Serialize};

/// Retrieval quality over a query/gallery split, all in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalMetrics {
    pub rank1: f32,
    pub rank5: f32,
    pub rank10: f32,
    pub map: f32,
    /// Queries with at least one valid gallery match.
    pub valid_queries: usize,
}

impl fmt::Display for RetrievalMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mAP: {:.1}% | Rank-1: {:.1}% | Rank-5: {:.1}% | Rank-10: {:.1}%",
            self.map * 100.0,
            self.rank1 * 100.0,
            self.rank5 * 100.0,
            self.rank10 * 100.0
        )
    }
}

/// Identity and camera of one query or gallery image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub pid: usize,
    pub camid: usize,
}

/// CMC curve (up to `max_rank`) and mAP with the Market-1501 protocol.
///
/// `distances` is row-major `[num_query, num_gallery]`. Gallery images with the
/// query's pid seen by the query's camera are discarded, and queries left
/// without any true match are skipped.
pub fn evaluate_rankings(
    distances: &[f32],
    query: &[Identity],
    gallery: &[Identity],
    max_rank: usize,
) -> (Vec<f32>, f32, usize) {
    assert_eq!(
        distances.len(),
        query.len() * gallery.len(),
        "distance matrix does not match {} queries x {} gallery images",
        query.len(),
        gallery.len()
    );

    let max_rank = max_rank.min(gallery.len());
    let mut cmc = vec![0.0f32; max_rank];
    let mut ap_sum = 0.0f32;
    let mut valid = 0usize;

    for (q, q_id) in query.iter().enumerate() {
        let row = &distances[q * gallery.len()..(q + 1) * gallery.len()];
        let mut order: Vec<usize> = (0..gallery.len()).collect();
        order.sort_by(|&a, &b| row[a].total_cmp(&row[b]));

        let matches: Vec<bool> = order
            .into_iter()
            .filter(|&g| !(gallery[g].pid == q_id.pid && gallery[g].camid == q_id.camid))
            .map(|g| gallery[g].pid == q_id.pid)
            .collect();

        let num_rel = matches.iter().filter(|&&m| m).count();
        if num_rel == 0 {
            continue;
        }
        valid += 1;

        if let Some(first) = matches.iter().position(|&m| m) {
            for hit in cmc.iter_mut().skip(first) {
                *hit += 1.0;
            }
        }

        let mut hits = 0usize;
        let mut precision_sum = 0.0f32;
        for (rank, _) in matches.iter().enumerate().filter(|(_, m)| **m) {
            hits += 1;
            precision_sum += hits as f32 / (rank + 1) as f32;
        }
        ap_sum += precision_sum / num_rel as f32;
    }

    if valid == 0 {
        log::warn!("No query has a valid gallery match");
        return (cmc, 0.0, 0);
    }

    cmc.iter_mut().for_each(|hit| *hit /= valid as f32);
    (cmc, ap_sum / valid as f32, valid)
}

impl RetrievalMetrics {
    pub fn from_rankings(distances: &[f32], query: &[Identity], gallery: &[Identity]) -> Self {
        let (cmc, map, valid_queries) = evaluate_rankings(distances, query, gallery, 10);
        let at = |rank: usize| cmc.get(rank - 1).or(cmc.last()).copied().unwrap_or(0.0);

        Self {
            rank1: at(1),
            rank5: at(5),
            rank10: at(10),
            map,
            valid_queries,
        }
    }
}
