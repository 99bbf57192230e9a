//! Semantic compression: reduces a working set to a size budget by
//! agglomerative clustering over message embeddings and per-cluster
//! representative selection.
//!
//! System-role messages encode operating instructions, not dialog, and pass
//! through untouched. Output preserves the original chronological order; it
//! is never re-sorted by importance.

use crate::embedding::cosine_similarity;
use crate::memory::{Message, Role};
use rayon::prelude::*;
use tracing::debug;

/// Target size for a compression pass: either a message count or an
/// aggregate character estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionBudget {
    Count(usize),
    Chars(usize),
}

#[derive(Debug, Clone)]
pub struct CompressorConfig {
    /// Tightest clustering distance threshold, used when the required
    /// compression is mild.
    pub min_distance_threshold: f32,
    /// Loosest threshold, used under heavy compression.
    pub max_distance_threshold: f32,
    /// Clusters whose summed importance exceeds this retain more than one
    /// representative.
    pub high_value_threshold: f32,
    /// Cap on `compress_iterative` passes.
    pub max_passes: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            min_distance_threshold: 0.25,
            max_distance_threshold: 0.75,
            high_value_threshold: 1.5,
            max_passes: 8,
        }
    }
}

#[derive(Clone)]
pub struct SemanticCompressor {
    config: CompressorConfig,
}

impl Default for SemanticCompressor {
    fn default() -> Self {
        Self::new(CompressorConfig::default())
    }
}

impl SemanticCompressor {
    pub fn new(config: CompressorConfig) -> Self {
        Self { config }
    }

    /// Single compression pass. Guarantees strictly fewer output messages
    /// than input whenever the budget is below the current size and at least
    /// two non-system messages exist; returns the input unchanged otherwise.
    pub fn compress(&self, messages: &[Message], budget: CompressionBudget) -> Vec<Message> {
        if Self::within_budget(messages, budget) {
            return messages.to_vec();
        }

        let (system, dialog): (Vec<&Message>, Vec<&Message>) =
            messages.iter().partition(|m| m.role == Role::System);

        // Clustering needs at least a pair to form a meaningful grouping.
        if dialog.len() < 2 {
            return messages.to_vec();
        }

        let remaining = Self::remaining_budget(&system, budget);
        let ratio = Self::compression_ratio(&dialog, remaining);
        let threshold = self.adaptive_threshold(ratio);
        debug!(
            "Compressing {} dialog messages (ratio {:.2}, distance threshold {:.2})",
            dialog.len(),
            ratio,
            threshold
        );

        let clusters = self.cluster_indices(&dialog, threshold);

        // Pick representatives per cluster: the highest-importance member,
        // or the top-k members when the cluster's importance mass crosses
        // the high-value threshold.
        let mut selected: Vec<usize> = Vec::new();
        for cluster in &clusters {
            let mass: f32 = cluster.iter().map(|&i| dialog[i].importance_score).sum();
            let keep = if mass > self.config.high_value_threshold {
                let k = (mass / self.config.high_value_threshold) as usize;
                k.clamp(1, cluster.len())
            } else {
                1
            };

            let mut ranked: Vec<usize> = cluster.clone();
            ranked.sort_by(|&a, &b| {
                dialog[b]
                    .importance_score
                    .partial_cmp(&dialog[a].importance_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(&b))
            });
            selected.extend(ranked.into_iter().take(keep));
        }

        // Enforce the budget by shedding the least important survivors.
        Self::trim_to_budget(&dialog, &mut selected, remaining);

        // Restore chronological order and merge system messages back in at
        // their original positions.
        selected.sort_unstable();
        let keep_ids: std::collections::HashSet<&str> =
            selected.iter().map(|&i| dialog[i].id.as_str()).collect();

        messages
            .iter()
            .filter(|m| m.role == Role::System || keep_ids.contains(m.id.as_str()))
            .cloned()
            .collect()
    }

    /// Re-invokes `compress` until the budget is met or no further reduction
    /// occurs, capped at `max_passes` to guarantee termination.
    pub fn compress_iterative(
        &self,
        messages: &[Message],
        budget: CompressionBudget,
    ) -> Vec<Message> {
        let mut current = messages.to_vec();
        for pass in 0..self.config.max_passes {
            if Self::within_budget(&current, budget) {
                break;
            }
            let next = self.compress(&current, budget);
            if next.len() >= current.len() {
                debug!("Compression made no progress after pass {pass}, stopping");
                break;
            }
            current = next;
        }
        current
    }

    /// Distance threshold adapted to the required compression ratio:
    /// `clamp(min + (max - min) * (1 - 1/ratio), min, max)`. Monotonically
    /// increasing in the ratio: mild compression merges only near-duplicate
    /// clusters, heavy compression merges aggressively.
    pub fn adaptive_threshold(&self, ratio: f32) -> f32 {
        let lo = self.config.min_distance_threshold;
        let hi = self.config.max_distance_threshold;
        let ratio = ratio.max(1.0);
        (lo + (hi - lo) * (1.0 - 1.0 / ratio)).clamp(lo, hi)
    }

    /// Average-linkage agglomerative clustering over cosine distance,
    /// merging until no inter-cluster distance is below `threshold`.
    /// Messages without an embedding stay singleton clusters.
    fn cluster_indices(&self, dialog: &[&Message], threshold: f32) -> Vec<Vec<usize>> {
        let n = dialog.len();
        let distances = Self::distance_matrix(dialog);
        let mut clusters: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();

        loop {
            let mut best: Option<(usize, usize, f32)> = None;
            for a in 0..clusters.len() {
                for b in (a + 1)..clusters.len() {
                    let d = Self::average_linkage(&distances, &clusters[a], &clusters[b]);
                    if d <= threshold && best.map_or(true, |(_, _, bd)| d < bd) {
                        best = Some((a, b, d));
                    }
                }
            }
            match best {
                Some((a, b, _)) => {
                    let merged = clusters.swap_remove(b);
                    clusters[a].extend(merged);
                }
                None => break,
            }
        }
        clusters
    }

    fn distance_matrix(dialog: &[&Message]) -> Vec<Vec<f32>> {
        let n = dialog.len();
        (0..n)
            .into_par_iter()
            .map(|i| {
                (0..n)
                    .map(|j| match (&dialog[i].embedding, &dialog[j].embedding) {
                        _ if i == j => 0.0,
                        (Some(a), Some(b)) => 1.0 - cosine_similarity(a, b),
                        // No embedding on either side: maximally distant so
                        // the pair never merges.
                        _ => 2.0,
                    })
                    .collect()
            })
            .collect()
    }

    fn average_linkage(distances: &[Vec<f32>], a: &[usize], b: &[usize]) -> f32 {
        let mut sum = 0.0;
        for &i in a {
            for &j in b {
                sum += distances[i][j];
            }
        }
        sum / (a.len() * b.len()) as f32
    }

    fn within_budget(messages: &[Message], budget: CompressionBudget) -> bool {
        match budget {
            CompressionBudget::Count(n) => messages.len() <= n,
            CompressionBudget::Chars(c) => {
                messages.iter().map(|m| m.size_chars()).sum::<usize>() <= c
            }
        }
    }

    /// Budget left for dialog messages after the system pass-through.
    fn remaining_budget(system: &[&Message], budget: CompressionBudget) -> CompressionBudget {
        match budget {
            CompressionBudget::Count(n) => CompressionBudget::Count(n.saturating_sub(system.len())),
            CompressionBudget::Chars(c) => {
                let used: usize = system.iter().map(|m| m.size_chars()).sum();
                CompressionBudget::Chars(c.saturating_sub(used))
            }
        }
    }

    fn compression_ratio(dialog: &[&Message], remaining: CompressionBudget) -> f32 {
        match remaining {
            CompressionBudget::Count(n) => dialog.len() as f32 / n.max(1) as f32,
            CompressionBudget::Chars(c) => {
                let total: usize = dialog.iter().map(|m| m.size_chars()).sum();
                total as f32 / c.max(1) as f32
            }
        }
    }

    /// Drops the lowest-importance selections until `remaining` is met.
    /// Always leaves at least one dialog message when the budget is nonzero.
    fn trim_to_budget(dialog: &[&Message], selected: &mut Vec<usize>, remaining: CompressionBudget) {
        let over = |selected: &[usize]| match remaining {
            CompressionBudget::Count(n) => selected.len() > n.max(1),
            CompressionBudget::Chars(c) => {
                selected.iter().map(|&i| dialog[i].size_chars()).sum::<usize>() > c
                    && selected.len() > 1
            }
        };

        while over(selected) {
            let weakest = selected
                .iter()
                .enumerate()
                .min_by(|(_, &a), (_, &b)| {
                    dialog[a]
                        .importance_score
                        .partial_cmp(&dialog[b].importance_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(b.cmp(&a))
                })
                .map(|(pos, _)| pos);
            match weakest {
                Some(pos) => {
                    selected.remove(pos);
                }
                None => break,
            }
        }
    }
}
