//! Error types for the clustering engine.

use thiserror::Error;

use crate::store::StoreKey;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("similarity threshold must be in (0, 1], got {0}")]
    InvalidThreshold(f64),

    #[error("invalid cluster size bounds: min={min}, max={max:?}")]
    InvalidClusterSize { min: usize, max: Option<usize> },

    #[error("similarity weights must be non-negative with a positive sum (token={token}, edit={edit})")]
    InvalidWeights { token: f64, edit: f64 },

    #[error("rebuild cancelled")]
    Cancelled,

    #[error("a rebuild is already running for {0}")]
    RebuildInProgress(StoreKey),

    #[error("no valid cluster set cached for {0}; a full rebuild is required")]
    MissingClusterSet(StoreKey),

    #[error("rebuild worker failed: {0}")]
    Worker(String),

    #[error("cluster store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;
