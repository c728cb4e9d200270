//! Hybrid prompt-similarity clustering for AI-generated image libraries.
//!
//! Images whose generation prompts are the same or nearly the same are
//! grouped into clusters, so a library browser can show one card per
//! "batch" instead of hundreds of near-duplicates. Start with
//! [`build_clusters`] for a full build, then keep the result current with
//! [`add_image`] and [`remove_images`] as files come and go.

pub mod clustering;
pub mod config;
pub mod error;
pub mod logging;
pub mod store;
pub mod tasks;

pub use clustering::{
    add_image, build_clusters, build_clusters_async, build_clusters_with, classify_new_image,
    position_in_cluster, remove_images, BuildControl, BuildOutcome, BuildPhase, Classification,
    Cluster, ClusterOptions, ImageRecord, MatchKind, RemovalOutcome, SimilarityWeights,
};
pub use config::Config;
pub use error::{ClusterError, ClusterResult};
pub use store::{ClusterSession, ClusterSet, ClusterStore, MemoryStore, ScanMode, SqliteStore, StoreKey};
pub use tasks::RebuildManager;
