//! k-reciprocal re-ranking (Zhong et al., CVPR 2017).
//!
//! Works on the `[N, N]` distance matrix of the query images followed by the
//! gallery images and returns the re-ranked `[Q, G]` query/gallery block.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReRanking {
    /// Neighbourhood size of the k-reciprocal sets.
    pub k1: usize,
    /// Neighbours averaged by local query expansion; 1 disables it.
    pub k2: usize,
    /// Weight of the original distance in the final one.
    pub lambda: f32,
}

impl Default for ReRanking {
    fn default() -> Self {
        Self {
            k1: 20,
            k2: 6,
            lambda: 0.3,
        }
    }
}

/// Sparse row of encoded neighbours, sorted by column.
type SparseRow = Vec<(usize, f32)>;

impl ReRanking {
    /// Re-rank `all_distances`, row-major `[N, N]` with the `num_query`
    /// queries first. Returns row-major `[num_query, N - num_query]`.
    pub fn apply(&self, all_distances: &[f32], num_query: usize) -> Vec<f32> {
        let n = (all_distances.len() as f64).sqrt().round() as usize;
        assert_eq!(n * n, all_distances.len(), "distance matrix must be square");
        assert!(num_query <= n, "more queries than images");

        let original = normalize_rows(all_distances, n);
        let initial_rank: Vec<Vec<usize>> = original
            .chunks(n)
            .map(|row| {
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by(|&a, &b| row[a].total_cmp(&row[b]));
                order
            })
            .collect();

        let half_k1 = (self.k1 as f64 / 2.0).round_ties_even() as usize;
        let mut encoded: Vec<SparseRow> = (0..n)
            .map(|i| {
                let reciprocal = k_reciprocal(&initial_rank, i, self.k1);
                let mut expansion = reciprocal.clone();
                for &candidate in &reciprocal {
                    let candidate_set = k_reciprocal(&initial_rank, candidate, half_k1);
                    let shared = candidate_set
                        .iter()
                        .filter(|c| reciprocal.contains(c))
                        .count();
                    if shared as f32 > 2.0 / 3.0 * candidate_set.len() as f32 {
                        expansion.extend(candidate_set);
                    }
                }
                expansion.sort_unstable();
                expansion.dedup();

                let row = &original[i * n..(i + 1) * n];
                let weights: Vec<f32> = expansion.iter().map(|&j| (-row[j]).exp()).collect();
                let total: f32 = weights.iter().sum();
                expansion
                    .into_iter()
                    .zip(weights)
                    .map(|(j, w)| (j, w / total))
                    .collect()
            })
            .collect();

        if self.k2 > 1 {
            encoded = query_expansion(&encoded, &initial_rank, self.k2, n);
        }

        let mut inverted: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, row) in encoded.iter().enumerate() {
            for &(j, _) in row {
                inverted[j].push(i);
            }
        }

        let num_gallery = n - num_query;
        let mut distances = Vec::with_capacity(num_query * num_gallery);
        for i in 0..num_query {
            let mut overlap = vec![0.0f32; n];
            for &(j, weight) in &encoded[i] {
                for &r in &inverted[j] {
                    overlap[r] += weight.min(lookup(&encoded[r], j));
                }
            }

            let row = &original[i * n..(i + 1) * n];
            for g in num_query..n {
                let jaccard = 1.0 - overlap[g] / (2.0 - overlap[g]);
                distances.push(jaccard * (1.0 - self.lambda) + row[g] * self.lambda);
            }
        }

        distances
    }
}

/// Divide every row by its maximum. The matrix is symmetric, so this equals
/// the column-wise normalization followed by a transpose.
fn normalize_rows(distances: &[f32], n: usize) -> Vec<f32> {
    distances
        .chunks(n)
        .flat_map(|row| {
            let max = row.iter().copied().fold(0.0f32, f32::max);
            let scale = if max > 0.0 { max } else { 1.0 };
            row.iter().map(move |d| d / scale)
        })
        .collect()
}

/// Members of the `k` nearest neighbours of `i` (itself included) that also
/// hold `i` among their own `k` nearest.
fn k_reciprocal(initial_rank: &[Vec<usize>], i: usize, k: usize) -> Vec<usize> {
    let k = (k + 1).min(initial_rank.len());
    initial_rank[i][..k]
        .iter()
        .copied()
        .filter(|&c| initial_rank[c][..k].contains(&i))
        .collect()
}

fn query_expansion(
    encoded: &[SparseRow],
    initial_rank: &[Vec<usize>],
    k2: usize,
    n: usize,
) -> Vec<SparseRow> {
    let k2 = k2.min(n);
    initial_rank
        .iter()
        .map(|rank| {
            let mut dense = vec![0.0f32; n];
            for &r in &rank[..k2] {
                for &(j, w) in &encoded[r] {
                    dense[j] += w;
                }
            }
            dense
                .into_iter()
                .enumerate()
                .filter(|&(_, w)| w != 0.0)
                .map(|(j, w)| (j, w / k2 as f32))
                .collect()
        })
        .collect()
}

fn lookup(row: &SparseRow, column: usize) -> f32 {
    row.binary_search_by_key(&column, |&(j, _)| j)
        .map(|pos| row[pos].1)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Squared distances between points on a line.
    fn line_distances(points: &[f32]) -> Vec<f32> {
        points
            .iter()
            .flat_map(|a| points.iter().map(move |b| (a - b) * (a - b)))
            .collect()
    }

    // two queries, then a gallery of two well separated clusters
    const POINTS: [f32; 10] = [0.05, 10.05, 0.0, 0.1, 0.2, 0.3, 10.0, 10.1, 10.2, 10.3];

    #[test]
    fn clusters_stay_apart_after_re_ranking() {
        let params = ReRanking {
            k1: 3,
            k2: 2,
            lambda: 0.3,
        };
        let distances = params.apply(&line_distances(&POINTS), 2);
        assert_eq!(distances.len(), 2 * 8);

        for (query, same) in [(0, 0..4), (1, 4..8)] {
            let row = &distances[query * 8..(query + 1) * 8];
            let worst_same = same.clone().map(|g| row[g]).fold(f32::MIN, f32::max);
            let best_other = (0..8)
                .filter(|g| !same.contains(g))
                .map(|g| row[g])
                .fold(f32::MAX, f32::min);
            assert!(worst_same < best_other, "query {query}: {row:?}");
            // disjoint neighbourhoods give a Jaccard distance of exactly 1
            assert!(best_other >= 1.0 - params.lambda);
        }
    }

    #[test]
    fn lambda_one_keeps_the_normalized_distance() {
        let params = ReRanking {
            k1: 3,
            k2: 1,
            lambda: 1.0,
        };
        let all = line_distances(&POINTS);
        let distances = params.apply(&all, 2);

        let max = all[..10].iter().copied().fold(0.0f32, f32::max);
        for g in 0..8 {
            assert!((distances[g] - all[2 + g] / max).abs() < 1e-6);
        }
    }

    #[test]
    fn default_neighbourhood_larger_than_the_set_is_clamped() {
        let params = ReRanking::default();
        let distances = params.apply(&line_distances(&POINTS), 2);

        assert_eq!(distances.len(), 16);
        assert!(distances.iter().all(|d| d.is_finite()));
        assert!(distances.iter().all(|&d| d <= 1.0 + 1e-6));
    }
}
