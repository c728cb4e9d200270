//! Prompt-similarity clustering engine.
//!
//! A full build runs five phases over the input records:
//! 1. exact grouping by normalized-prompt hash
//! 2. keyword extraction per group
//! 3. keyword indexing so only groups sharing keywords become candidates
//! 4. candidate-pair scoring and union-find merging
//! 5. chronological ordering and size checks
//!
//! Incremental maintenance lives in [`incremental`].

pub mod bucket;
pub mod control;
pub mod incremental;
pub mod keywords;
pub mod merge;
pub mod normalize;
pub mod refine;
pub mod similarity;
pub mod types;
pub mod union_find;

use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{ClusterError, ClusterResult};

pub use control::{BuildControl, BuildPhase};
pub use incremental::{
    add_image, classify_new_image, classify_with_weights, position_in_cluster, remove_images,
    Classification, MatchKind, RemovalOutcome,
};
pub use keywords::KeywordExtractor;
pub use normalize::{normalize_prompt, prompt_hash};
pub use similarity::{score, SimilarityWeights};
pub use types::{
    BuildOutcome, BuildStats, Cluster, ClusterBuilder, ClusterOptions, ImageRecord,
    OversizedCluster,
};

/// Cluster `images` from scratch.
pub fn build_clusters(images: &[ImageRecord], options: &ClusterOptions) -> ClusterResult<BuildOutcome> {
    build_clusters_with(images, options, &BuildControl::none())
}

/// Cluster `images` from scratch, checking `control` for cancellation
/// between phases and between chunks of each phase.
///
/// A cancelled build returns [`ClusterError::Cancelled`] and produces no
/// clusters at all.
pub fn build_clusters_with(
    images: &[ImageRecord],
    options: &ClusterOptions,
    control: &BuildControl,
) -> ClusterResult<BuildOutcome> {
    options.validate()?;
    let started = Instant::now();
    let now = types::now_millis();
    let mut stats = BuildStats {
        images: images.len(),
        ..BuildStats::default()
    };

    let (groups, skipped) = group_exact(images, options.chunk_size, control)?;
    stats.skipped_no_prompt = skipped;
    stats.exact_groups = groups.len();
    debug!(
        groups = groups.len(),
        skipped,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Exact grouping done"
    );

    let keywords = extract_keywords(&groups, options, control)?;

    control.checkpoint()?;
    let index = bucket::KeywordIndex::build(&keywords, options, control)?;
    debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Bucketing done"
    );

    control.checkpoint()?;
    let (merged, merge_stats) = merge::merge_groups(
        groups,
        &index,
        options.threshold,
        &options.weights,
        options.chunk_size,
        control,
    )?;
    drop(index);
    drop(keywords);
    stats.buckets = merge_stats.buckets;
    stats.largest_bucket = merge_stats.largest_bucket;
    stats.candidate_pairs = merge_stats.candidate_pairs;
    stats.comparisons = merge_stats.comparisons;
    stats.merges = merge_stats.merges;
    debug!(
        clusters = merged.len(),
        buckets = stats.buckets,
        largest_bucket = stats.largest_bucket,
        candidate_pairs = stats.candidate_pairs,
        comparisons = stats.comparisons,
        merges = stats.merges,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Merging done"
    );

    control.checkpoint()?;
    control.report(BuildPhase::Refining, 0, merged.len());
    let refined = refine::refine(merged, options, now);
    stats.below_min_size = refined.below_min_size;

    info!(
        images = stats.images,
        clusters = refined.clusters.len(),
        oversized = refined.oversized.len(),
        threshold = options.threshold,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Cluster build complete"
    );

    Ok(BuildOutcome {
        clusters: refined.clusters,
        oversized: refined.oversized,
        stats,
    })
}

/// Run a build on tokio's blocking pool.
pub async fn build_clusters_async(
    images: Vec<ImageRecord>,
    options: ClusterOptions,
    cancel: Arc<AtomicBool>,
) -> ClusterResult<BuildOutcome> {
    tokio::task::spawn_blocking(move || {
        build_clusters_with(&images, &options, &BuildControl::new(&cancel))
    })
    .await
    .map_err(|e| ClusterError::Worker(e.to_string()))?
}

/// Phase 1: one builder per distinct normalized prompt, in first-seen order.
fn group_exact(
    images: &[ImageRecord],
    chunk_size: usize,
    control: &BuildControl,
) -> ClusterResult<(Vec<ClusterBuilder>, usize)> {
    let chunk = chunk_size.max(1);
    let mut groups: Vec<ClusterBuilder> = Vec::new();
    let mut by_hash: HashMap<String, usize> = HashMap::new();
    let mut skipped = 0;

    for (index, image) in images.iter().enumerate() {
        if index % chunk == 0 {
            control.checkpoint()?;
            control.report(BuildPhase::ExactGrouping, index, images.len());
        }

        let normalized = match image.usable_prompt().map(normalize_prompt) {
            Some(normalized) if !normalized.is_empty() => normalized,
            _ => {
                skipped += 1;
                continue;
            }
        };

        let hash = prompt_hash(&normalized);
        let slot = *by_hash.entry(hash.clone()).or_insert_with(|| {
            groups.push(ClusterBuilder::new(hash, normalized));
            groups.len() - 1
        });
        groups[slot].add_image(&image.id, image.last_modified);
    }

    Ok((groups, skipped))
}

/// Phase 2: keywords per group, computed in parallel one chunk at a time.
fn extract_keywords(
    groups: &[ClusterBuilder],
    options: &ClusterOptions,
    control: &BuildControl,
) -> ClusterResult<Vec<Vec<String>>> {
    let extractor = KeywordExtractor::new(options.keyword_limit);
    let mut keywords = Vec::with_capacity(groups.len());

    for (index, chunk) in groups.chunks(options.chunk_size.max(1)).enumerate() {
        control.checkpoint()?;
        control.report(BuildPhase::Keywords, index * options.chunk_size.max(1), groups.len());
        let extracted: Vec<Vec<String>> = chunk
            .par_iter()
            .map(|group| extractor.extract(&group.base_prompt))
            .collect();
        keywords.extend(extracted);
    }

    Ok(keywords)
}
