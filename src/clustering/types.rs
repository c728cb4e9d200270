//! Value types shared across the clustering pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::similarity::SimilarityWeights;
use crate::error::{ClusterError, ClusterResult};

/// One image as handed over by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: String,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Epoch milliseconds. Only used for ordering.
    #[serde(default)]
    pub last_modified: i64,
}

impl ImageRecord {
    pub fn new(id: impl Into<String>, prompt: Option<&str>, last_modified: i64) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.map(str::to_string),
            last_modified,
        }
    }

    /// The prompt, if it carries any non-whitespace text.
    pub fn usable_prompt(&self) -> Option<&str> {
        self.prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
    }
}

/// A persisted group of images sharing an identical or near-identical prompt.
///
/// Members are kept oldest first together with their `lastModified` times.
/// `size` and `cover_image_id` are derived from `image_ids` and can only be
/// changed through methods that keep them in sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "ClusterRecord")]
pub struct Cluster {
    id: String,
    base_prompt: String,
    image_ids: Vec<String>,
    image_timestamps: Vec<i64>,
    cover_image_id: String,
    size: usize,
    similarity_threshold: f64,
    created_at: i64,
    updated_at: i64,
}

/// Wire shape of a cluster. Derived fields are recomputed on load.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterRecord {
    id: String,
    base_prompt: String,
    image_ids: Vec<String>,
    #[serde(default)]
    image_timestamps: Vec<i64>,
    similarity_threshold: f64,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    updated_at: i64,
}

impl From<ClusterRecord> for Cluster {
    fn from(record: ClusterRecord) -> Self {
        let mut image_timestamps = record.image_timestamps;
        if image_timestamps.len() != record.image_ids.len() {
            // Unknown times sort before any real file time.
            image_timestamps = vec![i64::MIN; record.image_ids.len()];
        }
        let mut cluster = Cluster {
            id: record.id,
            base_prompt: record.base_prompt,
            image_ids: record.image_ids,
            image_timestamps,
            cover_image_id: String::new(),
            size: 0,
            similarity_threshold: record.similarity_threshold,
            created_at: record.created_at,
            updated_at: record.updated_at,
        };
        cluster.sync_derived();
        cluster
    }
}

impl Cluster {
    /// Build a cluster from `(image_id, last_modified)` pairs, already in
    /// chronological order.
    pub fn new(
        id: impl Into<String>,
        base_prompt: impl Into<String>,
        members: Vec<(String, i64)>,
        similarity_threshold: f64,
        now: i64,
    ) -> Self {
        let (image_ids, image_timestamps): (Vec<String>, Vec<i64>) = members.into_iter().unzip();
        let mut cluster = Self {
            id: id.into(),
            base_prompt: base_prompt.into(),
            image_ids,
            image_timestamps,
            cover_image_id: String::new(),
            size: 0,
            similarity_threshold,
            created_at: now,
            updated_at: now,
        };
        cluster.sync_derived();
        cluster
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base_prompt(&self) -> &str {
        &self.base_prompt
    }

    pub fn image_ids(&self) -> &[String] {
        &self.image_ids
    }

    /// `lastModified` of each member, parallel to [`image_ids`](Self::image_ids).
    pub fn image_timestamps(&self) -> &[i64] {
        &self.image_timestamps
    }

    pub fn cover_image_id(&self) -> &str {
        &self.cover_image_id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn similarity_threshold(&self) -> f64 {
        self.similarity_threshold
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }

    pub fn contains(&self, image_id: &str) -> bool {
        self.image_ids.iter().any(|id| id == image_id)
    }

    /// Insert after every member that is not newer, so ties keep arrival order.
    pub(crate) fn insert_image(&mut self, image_id: String, last_modified: i64, now: i64) {
        let at = self.image_timestamps.partition_point(|&t| t <= last_modified);
        self.image_ids.insert(at, image_id);
        self.image_timestamps.insert(at, last_modified);
        self.updated_at = now;
        self.sync_derived();
    }

    /// Keep only the images accepted by `keep`. Returns how many were dropped.
    pub(crate) fn retain_images<F>(&mut self, mut keep: F, now: i64) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.image_ids.len();
        let mut kept_times = Vec::with_capacity(before);
        let mut times = self.image_timestamps.iter();
        self.image_ids.retain(|id| {
            let time = times.next().copied().unwrap_or(i64::MIN);
            let kept = keep(id);
            if kept {
                kept_times.push(time);
            }
            kept
        });
        let dropped = before - self.image_ids.len();
        if dropped > 0 {
            self.image_timestamps = kept_times;
            self.updated_at = now;
            self.sync_derived();
        }
        dropped
    }

    fn sync_derived(&mut self) {
        self.size = self.image_ids.len();
        self.cover_image_id = self.image_ids.first().cloned().unwrap_or_default();
    }
}

/// Mutable accumulator used while the pipeline runs.
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    pub prompt_hash: String,
    pub base_prompt: String,
    pub image_ids: Vec<String>,
    pub timestamps: HashMap<String, i64>,
}

impl ClusterBuilder {
    pub fn new(prompt_hash: String, base_prompt: String) -> Self {
        Self {
            prompt_hash,
            base_prompt,
            image_ids: Vec::new(),
            timestamps: HashMap::new(),
        }
    }

    pub fn add_image(&mut self, image_id: &str, last_modified: i64) {
        self.image_ids.push(image_id.to_string());
        self.timestamps.insert(image_id.to_string(), last_modified);
    }

    /// Append every image of `other`, keeping this builder's identity.
    pub fn absorb(&mut self, other: ClusterBuilder) {
        self.image_ids.extend(other.image_ids);
        self.timestamps.extend(other.timestamps);
    }

    pub fn len(&self) -> usize {
        self.image_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }

    pub fn finish(self, similarity_threshold: f64, now: i64) -> Cluster {
        let timestamps = self.timestamps;
        let members = self
            .image_ids
            .into_iter()
            .map(|id| {
                let time = timestamps.get(&id).copied().unwrap_or(i64::MIN);
                (id, time)
            })
            .collect();
        Cluster::new(
            self.prompt_hash,
            self.base_prompt,
            members,
            similarity_threshold,
            now,
        )
    }
}

/// Tunables for a full build.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOptions {
    pub threshold: f64,
    pub min_cluster_size: usize,
    pub max_cluster_size: Option<usize>,
    pub keyword_limit: usize,
    pub min_shared_keywords: usize,
    /// Keywords carried by more groups than this are ignored for bucketing.
    pub max_keyword_groups: usize,
    pub weights: SimilarityWeights,
    /// Items processed between cancellation checks.
    pub chunk_size: usize,
}

pub const DEFAULT_THRESHOLD: f64 = 0.85;
pub const DEFAULT_KEYWORD_LIMIT: usize = 10;
pub const DEFAULT_MIN_SHARED_KEYWORDS: usize = 2;
pub const DEFAULT_MAX_KEYWORD_GROUPS: usize = 2000;
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_cluster_size: 1,
            max_cluster_size: None,
            keyword_limit: DEFAULT_KEYWORD_LIMIT,
            min_shared_keywords: DEFAULT_MIN_SHARED_KEYWORDS,
            max_keyword_groups: DEFAULT_MAX_KEYWORD_GROUPS,
            weights: SimilarityWeights::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ClusterOptions {
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ClusterResult<()> {
        validate_threshold(self.threshold)?;
        if self.min_cluster_size == 0 {
            return Err(ClusterError::InvalidClusterSize {
                min: self.min_cluster_size,
                max: self.max_cluster_size,
            });
        }
        if let Some(max) = self.max_cluster_size {
            if max < self.min_cluster_size {
                return Err(ClusterError::InvalidClusterSize {
                    min: self.min_cluster_size,
                    max: self.max_cluster_size,
                });
            }
        }
        self.weights.validate()
    }
}

pub(crate) fn validate_threshold(threshold: f64) -> ClusterResult<()> {
    if threshold > 0.0 && threshold <= 1.0 {
        Ok(())
    } else {
        Err(ClusterError::InvalidThreshold(threshold))
    }
}

/// A cluster larger than `max_cluster_size`. Kept intact, surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OversizedCluster {
    pub cluster_id: String,
    pub size: usize,
    pub limit: usize,
}

/// Counters gathered during a full build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub images: usize,
    pub skipped_no_prompt: usize,
    pub exact_groups: usize,
    /// Groups that had at least one candidate partner.
    pub buckets: usize,
    pub largest_bucket: usize,
    /// Pairs sharing enough keywords to be considered.
    pub candidate_pairs: usize,
    /// Candidate pairs that needed a full edit-distance score.
    pub comparisons: usize,
    pub merges: usize,
    /// Clusters left out because they are smaller than `min_cluster_size`.
    pub below_min_size: usize,
}

/// Result of a full build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub clusters: Vec<Cluster>,
    pub oversized: Vec<OversizedCluster>,
    pub stats: BuildStats,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
