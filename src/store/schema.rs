pub const SCHEMA: &str = r#"
-- One cached cluster set per directory and scan mode
CREATE TABLE IF NOT EXISTS cluster_cache (
    directory TEXT NOT NULL,
    scan_mode TEXT NOT NULL,
    engine_version INTEGER NOT NULL,
    similarity_threshold REAL NOT NULL,
    cluster_count INTEGER NOT NULL,
    payload TEXT NOT NULL,  -- ClusterSet as JSON
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (directory, scan_mode)
);

CREATE INDEX IF NOT EXISTS idx_cluster_cache_version ON cluster_cache(engine_version);
"#;

