//! Candidate-pair scoring and transitive merging of groups.

use rayon::prelude::*;
use std::collections::HashMap;

use super::bucket::KeywordIndex;
use super::control::{BuildControl, BuildPhase};
use super::similarity::{score_if_reachable, PromptProfile, SimilarityWeights};
use super::types::ClusterBuilder;
use super::union_find::UnionFind;
use crate::error::ClusterResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Groups with at least one bucket mate.
    pub buckets: usize,
    /// Largest bucket, counting the group itself.
    pub largest_bucket: usize,
    /// Pairs sharing enough keywords to be considered.
    pub candidate_pairs: usize,
    /// Candidate pairs that survived pruning and were fully scored.
    pub comparisons: usize,
    pub merges: usize,
}

/// Matches found for one group against its later bucket mates.
struct GroupMatches {
    group: usize,
    mates: usize,
    comparisons: usize,
    matched: Vec<usize>,
}

/// Merge exact-match groups whose prompts score at or above `threshold`.
///
/// Only candidate pairs from `index` are scored. Scoring runs in parallel
/// one chunk of groups at a time; matches feed a single union-find, so
/// membership is transitively closed across buckets. Each merged builder
/// keeps the identity and base prompt of its earliest group.
pub fn merge_groups(
    groups: Vec<ClusterBuilder>,
    index: &KeywordIndex<'_>,
    threshold: f64,
    weights: &SimilarityWeights,
    chunk_size: usize,
    control: &BuildControl,
) -> ClusterResult<(Vec<ClusterBuilder>, MergeStats)> {
    let profiles: Vec<PromptProfile> = groups
        .iter()
        .map(|g| PromptProfile::new(&g.base_prompt))
        .collect();

    let total = groups.len();
    let chunk = chunk_size.max(1);
    let mut uf = UnionFind::new(total);
    let mut stats = MergeStats::default();

    for start in (0..total).step_by(chunk) {
        control.checkpoint()?;
        control.report(BuildPhase::Merging, start, total);
        let end = (start + chunk).min(total);

        let found: Vec<GroupMatches> = (start..end)
            .into_par_iter()
            .map_init(HashMap::new, |shared, group| -> ClusterResult<GroupMatches> {
                control.checkpoint()?;
                let mates = index.bucket_mates(group, shared);
                let mut comparisons = 0;
                let mut matched = Vec::new();
                for &other in &mates {
                    let (a, b) = (&profiles[group], &profiles[other]);
                    if let Some(score) = score_if_reachable(a, b, weights, threshold) {
                        comparisons += 1;
                        if score >= threshold {
                            matched.push(other);
                        }
                    }
                }
                Ok(GroupMatches {
                    group,
                    mates: mates.len(),
                    comparisons,
                    matched,
                })
            })
            .collect::<ClusterResult<_>>()?;

        for result in found {
            if result.mates > 0 {
                stats.buckets += 1;
                stats.largest_bucket = stats.largest_bucket.max(result.mates + 1);
            }
            stats.candidate_pairs += result.mates;
            stats.comparisons += result.comparisons;
            for other in result.matched {
                if uf.union(result.group, other) {
                    stats.merges += 1;
                }
            }
        }
    }
    drop(profiles);

    let mut slots: Vec<Option<ClusterBuilder>> = groups.into_iter().map(Some).collect();
    let mut merged = Vec::new();
    for members in uf.components() {
        let mut members = members.into_iter();
        let Some(mut root) = members.next().and_then(|i| slots[i].take()) else {
            continue;
        };
        for member in members {
            if let Some(group) = slots[member].take() {
                root.absorb(group);
            }
        }
        merged.push(root);
    }

    Ok((merged, stats))
}
