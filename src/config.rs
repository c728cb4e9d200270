use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::clustering::types::{
    DEFAULT_CHUNK_SIZE, DEFAULT_KEYWORD_LIMIT, DEFAULT_MAX_KEYWORD_GROUPS,
    DEFAULT_MIN_SHARED_KEYWORDS, DEFAULT_THRESHOLD,
};
use crate::clustering::{ClusterOptions, SimilarityWeights};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "PROMPT_CLUSTER_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Minimum hybrid similarity for two prompts to share a cluster, in (0, 1].
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,

    /// Clusters above this size are reported but kept whole.
    #[serde(default)]
    pub max_cluster_size: Option<usize>,

    #[serde(default = "default_keyword_limit")]
    pub keyword_limit: usize,

    #[serde(default = "default_min_shared_keywords")]
    pub min_shared_keywords: usize,

    /// Keywords found in more prompt groups than this are not used for bucketing.
    #[serde(default = "default_max_keyword_groups")]
    pub max_keyword_groups: usize,

    #[serde(default = "default_weight")]
    pub token_weight: f64,

    #[serde(default = "default_weight")]
    pub edit_weight: f64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_similarity_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_min_cluster_size() -> usize {
    1
}

fn default_keyword_limit() -> usize {
    DEFAULT_KEYWORD_LIMIT
}

fn default_min_shared_keywords() -> usize {
    DEFAULT_MIN_SHARED_KEYWORDS
}

fn default_max_keyword_groups() -> usize {
    DEFAULT_MAX_KEYWORD_GROUPS
}

fn default_weight() -> f64 {
    0.5
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            min_cluster_size: default_min_cluster_size(),
            max_cluster_size: None,
            keyword_limit: default_keyword_limit(),
            min_shared_keywords: default_min_shared_keywords(),
            max_keyword_groups: default_max_keyword_groups(),
            token_weight: default_weight(),
            edit_weight: default_weight(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl ClusteringConfig {
    pub fn to_options(&self) -> ClusterOptions {
        ClusterOptions {
            threshold: self.similarity_threshold,
            min_cluster_size: self.min_cluster_size,
            max_cluster_size: self.max_cluster_size,
            keyword_limit: self.keyword_limit,
            min_shared_keywords: self.min_shared_keywords,
            max_keyword_groups: self.max_keyword_groups,
            weights: SimilarityWeights {
                token: self.token_weight,
                edit: self.edit_weight,
            },
            chunk_size: self.chunk_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("prompt-cluster")
        .join("clusters.db")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
        }
    }
}

impl Config {
    /// Load from `$PROMPT_CLUSTER_CONFIG` or the default location, writing
    /// a default file when none exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.clustering.to_options().validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("prompt-cluster")
    }

    fn config_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("config.toml"))
    }
}
