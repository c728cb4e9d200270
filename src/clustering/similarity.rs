//! Hybrid prompt similarity: token-set overlap blended with edit distance.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{ClusterError, ClusterResult};

/// Slack for float rounding when comparing a ceiling to the threshold.
const BOUND_EPSILON: f64 = 1e-9;

/// Blend weights for the two similarity signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    /// Weight of the token-set (Jaccard) overlap.
    pub token: f64,
    /// Weight of the normalized character edit-distance ratio.
    pub edit: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            token: 0.5,
            edit: 0.5,
        }
    }
}

impl SimilarityWeights {
    pub fn validate(&self) -> ClusterResult<()> {
        let finite = self.token.is_finite() && self.edit.is_finite();
        if !finite || self.token < 0.0 || self.edit < 0.0 || self.token + self.edit <= 0.0 {
            return Err(ClusterError::InvalidWeights {
                token: self.token,
                edit: self.edit,
            });
        }
        Ok(())
    }

    fn blend(&self, token_score: f64, edit_score: f64) -> f64 {
        let total = self.token + self.edit;
        ((self.token * token_score + self.edit * edit_score) / total).clamp(0.0, 1.0)
    }
}

/// A normalized prompt with the pieces the scorer needs precomputed.
#[derive(Debug, Clone)]
pub struct PromptProfile<'a> {
    text: &'a str,
    tokens: HashSet<&'a str>,
    chars: usize,
}

impl<'a> PromptProfile<'a> {
    pub fn new(normalized: &'a str) -> Self {
        Self {
            text: normalized,
            tokens: normalized.split(' ').filter(|t| !t.is_empty()).collect(),
            chars: normalized.chars().count(),
        }
    }
}

/// Score two normalized prompts in [0, 1].
pub fn score(a: &str, b: &str, weights: &SimilarityWeights) -> f64 {
    score_profiles(&PromptProfile::new(a), &PromptProfile::new(b), weights)
}

pub fn score_profiles(a: &PromptProfile, b: &PromptProfile, weights: &SimilarityWeights) -> f64 {
    if a.text == b.text {
        return 1.0;
    }
    let token_score = jaccard(&a.tokens, &b.tokens);
    let edit_score = strsim::normalized_levenshtein(a.text, b.text);
    weights.blend(token_score, edit_score)
}

/// Cheap ceiling on `score_profiles` derived from lengths alone.
///
/// Edit distance is at least the length difference and the Jaccard index is
/// at most the smaller set over the larger, so pairs whose ceiling is below
/// the threshold can be skipped without computing Levenshtein.
pub fn score_upper_bound(a: &PromptProfile, b: &PromptProfile, weights: &SimilarityWeights) -> f64 {
    if a.text == b.text {
        return 1.0;
    }
    weights.blend(
        size_ratio(a.tokens.len(), b.tokens.len()),
        size_ratio(a.chars, b.chars),
    )
}

/// Score a candidate pair only if it can still reach `threshold`.
///
/// Two ceilings are tried before the edit distance: one from lengths alone,
/// then one from the exact token overlap with the edit ratio capped by the
/// length ratio. `None` means the pair was pruned; a returned score may
/// still fall below the threshold.
pub fn score_if_reachable(
    a: &PromptProfile,
    b: &PromptProfile,
    weights: &SimilarityWeights,
    threshold: f64,
) -> Option<f64> {
    if a.text == b.text {
        return Some(1.0);
    }
    if score_upper_bound(a, b, weights) + BOUND_EPSILON < threshold {
        return None;
    }
    let token_score = jaccard(&a.tokens, &b.tokens);
    if weights.blend(token_score, size_ratio(a.chars, b.chars)) + BOUND_EPSILON < threshold {
        return None;
    }
    let edit_score = strsim::normalized_levenshtein(a.text, b.text);
    Some(weights.blend(token_score, edit_score))
}

fn size_ratio(x: usize, y: usize) -> f64 {
    let (lo, hi) = if x <= y { (x, y) } else { (y, x) };
    if hi == 0 {
        1.0
    } else {
        lo as f64 / hi as f64
    }
}

fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}
