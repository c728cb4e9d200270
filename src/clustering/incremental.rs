//! Single-image maintenance of an existing cluster set.

use std::collections::HashSet;
use tracing::debug;

use super::normalize::{normalize_prompt, prompt_hash};
use super::similarity::{score_profiles, PromptProfile, SimilarityWeights};
use super::types::{now_millis, validate_threshold, Cluster, ImageRecord};
use crate::error::ClusterResult;

/// How a new image relates to the existing clusters.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchKind {
    /// No usable prompt; `cluster_id` is the image id by caller convention.
    NoPrompt,
    /// The image is already a member of `cluster_id`.
    AlreadyPresent,
    /// Normalized prompt hashes to an existing cluster id.
    Exact,
    /// First cluster whose base prompt scored at or above the threshold.
    Similar { score: f64 },
    /// Nothing matched; `cluster_id` is the hash to mint a cluster under.
    New,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub cluster_id: String,
    pub is_new_cluster: bool,
    pub kind: MatchKind,
}

/// Decide where a new image belongs, using the default blend weights.
pub fn classify_new_image(
    image: &ImageRecord,
    clusters: &[Cluster],
    threshold: f64,
) -> ClusterResult<Classification> {
    classify_with_weights(image, clusters, threshold, &SimilarityWeights::default())
}

/// Decide where a new image belongs.
///
/// Exact hash matches win. Otherwise clusters are scanned in order and the
/// first one scoring at or above `threshold` is taken, even if a later one
/// would score higher.
pub fn classify_with_weights(
    image: &ImageRecord,
    clusters: &[Cluster],
    threshold: f64,
    weights: &SimilarityWeights,
) -> ClusterResult<Classification> {
    validate_threshold(threshold)?;
    weights.validate()?;

    let normalized = match image.usable_prompt().map(normalize_prompt) {
        Some(normalized) if !normalized.is_empty() => normalized,
        _ => {
            return Ok(Classification {
                cluster_id: image.id.clone(),
                is_new_cluster: true,
                kind: MatchKind::NoPrompt,
            })
        }
    };

    let hash = prompt_hash(&normalized);
    if let Some(cluster) = clusters.iter().find(|c| c.id() == hash) {
        return Ok(Classification {
            cluster_id: cluster.id().to_string(),
            is_new_cluster: false,
            kind: MatchKind::Exact,
        });
    }

    let profile = PromptProfile::new(&normalized);
    for cluster in clusters {
        let score = score_profiles(&profile, &PromptProfile::new(cluster.base_prompt()), weights);
        if score >= threshold {
            return Ok(Classification {
                cluster_id: cluster.id().to_string(),
                is_new_cluster: false,
                kind: MatchKind::Similar { score },
            });
        }
    }

    Ok(Classification {
        cluster_id: hash,
        is_new_cluster: true,
        kind: MatchKind::New,
    })
}

/// Classify `image` and apply the result to `clusters`.
///
/// Matches are inserted by `last_modified`, so a late-indexed file with an
/// old timestamp can become the new cover. Images without a prompt are never
/// inserted.
pub fn add_image(
    image: &ImageRecord,
    clusters: &mut Vec<Cluster>,
    threshold: f64,
    weights: &SimilarityWeights,
) -> ClusterResult<Classification> {
    validate_threshold(threshold)?;

    if image.usable_prompt().is_some() {
        if let Some(existing) = clusters.iter().find(|c| c.contains(&image.id)) {
            return Ok(Classification {
                cluster_id: existing.id().to_string(),
                is_new_cluster: false,
                kind: MatchKind::AlreadyPresent,
            });
        }
    }

    let classification = classify_with_weights(image, clusters, threshold, weights)?;
    let now = now_millis();

    match classification.kind {
        MatchKind::NoPrompt | MatchKind::AlreadyPresent => {}
        MatchKind::Exact | MatchKind::Similar { .. } => {
            if let Some(cluster) = clusters
                .iter_mut()
                .find(|c| c.id() == classification.cluster_id)
            {
                cluster.insert_image(image.id.clone(), image.last_modified, now);
            }
        }
        MatchKind::New => {
            let base_prompt = image.usable_prompt().map(normalize_prompt).unwrap_or_default();
            clusters.push(Cluster::new(
                classification.cluster_id.clone(),
                base_prompt,
                vec![(image.id.clone(), image.last_modified)],
                threshold,
                now,
            ));
        }
    }

    debug!(
        image_id = %image.id,
        cluster_id = %classification.cluster_id,
        kind = ?classification.kind,
        "Classified new image"
    );
    Ok(classification)
}

#[derive(Debug, Clone)]
pub struct RemovalOutcome {
    pub clusters: Vec<Cluster>,
    /// Clusters dropped because their last member was removed.
    pub removed_clusters: usize,
    pub removed_images: usize,
}

/// Drop deleted images from every cluster, pruning clusters left empty.
pub fn remove_images<I, S>(deleted_ids: I, clusters: Vec<Cluster>) -> RemovalOutcome
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let deleted: HashSet<String> = deleted_ids
        .into_iter()
        .map(|id| id.as_ref().to_string())
        .collect();
    let now = now_millis();

    let mut removed_images = 0;
    let mut removed_clusters = 0;
    let mut kept = Vec::with_capacity(clusters.len());

    for mut cluster in clusters {
        removed_images += cluster.retain_images(|id| !deleted.contains(id), now);
        if cluster.is_empty() {
            removed_clusters += 1;
        } else {
            kept.push(cluster);
        }
    }

    if removed_images > 0 {
        debug!(removed_images, removed_clusters, "Removed deleted images from clusters");
    }

    RemovalOutcome {
        clusters: kept,
        removed_clusters,
        removed_images,
    }
}

/// Zero-based position of `image_id` within `cluster`, oldest first.
pub fn position_in_cluster(image_id: &str, cluster: &Cluster) -> Option<usize> {
    cluster.image_ids().iter().position(|id| id == image_id)
}
