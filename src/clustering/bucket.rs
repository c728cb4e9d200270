//! Keyword co-occurrence bucketing of exact-match groups.
//!
//! Every group has its own bucket: the groups sharing at least
//! `min_shared_keywords` keywords with it. Buckets overlap and are never
//! chained together, so a library drawn from one tag vocabulary does not
//! collapse into a single bucket. Keywords that appear in more than
//! `max_keyword_groups` groups are too common to discriminate and are not
//! indexed. Truly similar prompts with sparse keyword overlap can miss each
//! other; that recall loss is accepted.

use std::collections::HashMap;
use tracing::debug;

use super::control::{BuildControl, BuildPhase};
use super::types::ClusterOptions;
use crate::error::ClusterResult;

/// Inverted index from keyword to the groups carrying it.
#[derive(Debug)]
pub struct KeywordIndex<'a> {
    keywords: &'a [Vec<String>],
    /// Posting lists, ascending by group.
    postings: HashMap<&'a str, Vec<usize>>,
    min_shared: usize,
}

impl<'a> KeywordIndex<'a> {
    pub fn build(
        keywords: &'a [Vec<String>],
        options: &ClusterOptions,
        control: &BuildControl,
    ) -> ClusterResult<Self> {
        let chunk = options.chunk_size.max(1);
        let mut postings: HashMap<&'a str, Vec<usize>> = HashMap::new();

        for (group, words) in keywords.iter().enumerate() {
            if group % chunk == 0 {
                control.checkpoint()?;
                control.report(BuildPhase::Bucketing, group, keywords.len());
            }
            for word in words {
                postings.entry(word.as_str()).or_default().push(group);
            }
        }

        let indexed = postings.len();
        postings.retain(|_, groups| groups.len() <= options.max_keyword_groups);
        debug!(
            keywords = indexed,
            too_common = indexed - postings.len(),
            "Keyword index built"
        );

        Ok(Self {
            keywords,
            postings,
            min_shared: options.min_shared_keywords.max(1),
        })
    }

    /// Later groups in the bucket of `group`, ascending.
    ///
    /// Only groups after `group` are returned so each pair is produced once.
    /// `shared` is scratch space reused across calls.
    pub fn bucket_mates(&self, group: usize, shared: &mut HashMap<usize, usize>) -> Vec<usize> {
        shared.clear();
        let Some(words) = self.keywords.get(group) else {
            return Vec::new();
        };

        for word in words {
            let Some(postings) = self.postings.get(word.as_str()) else {
                continue;
            };
            let start = postings.partition_point(|&other| other <= group);
            for &other in &postings[start..] {
                *shared.entry(other).or_insert(0) += 1;
            }
        }

        let mut mates: Vec<usize> = shared
            .iter()
            .filter(|(_, &count)| count >= self.min_shared)
            .map(|(&other, _)| other)
            .collect();
        mates.sort_unstable();
        mates
    }
}
