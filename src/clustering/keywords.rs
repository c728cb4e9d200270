//! Significant-token extraction used for bucketing.
//!
//! Keywords only decide which groups get compared; they never feed into the
//! similarity score itself.

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "of", "in", "on", "at", "to", "for", "with", "by",
    "from", "as", "is", "are", "was", "were", "be", "been", "being", "it", "its", "this", "that",
    "these", "those", "into", "onto", "over", "under", "very", "some", "any", "no", "not", "his",
    "her", "their", "our", "my", "your", "he", "she", "they", "we", "you", "i", "me", "him", "them",
    "up", "down", "out", "off", "while", "has", "have", "had", "there", "here", "than", "then",
];

/// Tokens longer than this do not score higher.
const LENGTH_CAP: usize = 12;

#[derive(Debug, Clone)]
pub struct KeywordExtractor {
    limit: usize,
    stopwords: HashSet<&'static str>,
}

impl KeywordExtractor {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            stopwords: STOPWORDS.iter().copied().collect(),
        }
    }

    pub fn is_stopword(&self, token: &str) -> bool {
        self.stopwords.contains(token)
    }

    /// Extract up to `limit` distinct keywords from a normalized prompt.
    ///
    /// Tokens are weighted by position (earlier is heavier, as prompt
    /// authors lead with the subject) plus length. Ties keep prompt order.
    pub fn extract(&self, normalized: &str) -> Vec<String> {
        let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
        let total = tokens.len().max(1) as f64;

        let mut seen = HashSet::new();
        let mut scored: Vec<(f64, usize, &str)> = Vec::new();

        for (position, token) in tokens.iter().enumerate() {
            if !self.is_significant(token) || !seen.insert(*token) {
                continue;
            }
            let position_weight = 1.0 - position as f64 / total;
            let length_weight = token.chars().count().min(LENGTH_CAP) as f64 / LENGTH_CAP as f64;
            scored.push((position_weight + length_weight, position, token));
        }

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(self.limit)
            .map(|(_, _, token)| token.to_string())
            .collect()
    }

    fn is_significant(&self, token: &str) -> bool {
        if token.chars().count() < 2 {
            return false;
        }
        // Bare numbers are mostly attention weights or seeds.
        if token.chars().all(|c| c.is_numeric()) {
            return false;
        }
        !self.is_stopword(token)
    }
}

impl Default for KeywordExtractor {
    fn default() -> Self {
        Self::new(super::types::DEFAULT_KEYWORD_LIMIT)
    }
}
