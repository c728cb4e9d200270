//! Final ordering and size checks on merged groups.

use tracing::warn;

use super::types::{Cluster, ClusterBuilder, ClusterOptions, OversizedCluster};

#[derive(Debug, Default)]
pub struct Refined {
    pub clusters: Vec<Cluster>,
    pub oversized: Vec<OversizedCluster>,
    pub below_min_size: usize,
}

/// Order members oldest first and turn builders into clusters.
///
/// The earliest image becomes the cover; ties keep merge order. Clusters
/// above `max_cluster_size` are kept whole and reported, never split or
/// truncated.
pub fn refine(merged: Vec<ClusterBuilder>, options: &ClusterOptions, now: i64) -> Refined {
    let mut refined = Refined::default();

    for mut builder in merged {
        sort_chronologically(&mut builder);

        if builder.len() < options.min_cluster_size {
            refined.below_min_size += 1;
            continue;
        }

        if let Some(limit) = options.max_cluster_size {
            if builder.len() > limit {
                warn!(
                    cluster_id = %builder.prompt_hash,
                    size = builder.len(),
                    limit,
                    "Cluster exceeds maximum size; keeping it intact"
                );
                refined.oversized.push(OversizedCluster {
                    cluster_id: builder.prompt_hash.clone(),
                    size: builder.len(),
                    limit,
                });
            }
        }

        refined.clusters.push(builder.finish(options.threshold, now));
    }

    refined
}

fn sort_chronologically(builder: &mut ClusterBuilder) {
    let timestamps = &builder.timestamps;
    builder
        .image_ids
        .sort_by_key(|id| timestamps.get(id).copied().unwrap_or(i64::MAX));
}
