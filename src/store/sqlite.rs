//! SQLite-backed cluster cache.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use super::schema::SCHEMA;
use super::{ClusterSet, ClusterStore, RebuildLocks, StoreKey};

pub struct SqliteStore {
    conn: Mutex<Connection>,
    locks: RebuildLocks,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cluster cache at {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            locks: RebuildLocks::new(),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("cluster cache connection lock poisoned"))
    }

    /// Every key with a cached set, for diagnostics.
    pub fn keys(&self) -> Result<Vec<(StoreKey, u32, usize)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT directory, scan_mode, engine_version, cluster_count FROM cluster_cache ORDER BY directory, scan_mode",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(directory, mode, version, count)| {
                let scan_mode = mode.parse().ok()?;
                Some((StoreKey { directory, scan_mode }, version, count as usize))
            })
            .collect();
        Ok(rows)
    }
}

impl ClusterStore for SqliteStore {
    fn load(&self, key: &StoreKey) -> Result<Option<ClusterSet>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT payload FROM cluster_cache WHERE directory = ? AND scan_mode = ?",
            rusqlite::params![key.directory, key.scan_mode.as_str()],
            |row| row.get::<_, String>(0),
        );
        let payload = match result {
            Ok(payload) => payload,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // A payload from an older engine may not parse; treat it as absent so
        // the caller rebuilds.
        match serde_json::from_str::<ClusterSet>(&payload) {
            Ok(set) => Ok(Some(set)),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding unreadable cached cluster set");
                Ok(None)
            }
        }
    }

    fn save(&self, key: &StoreKey, set: &ClusterSet) -> Result<()> {
        let payload = serde_json::to_string(set)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO cluster_cache (
                directory, scan_mode, engine_version, similarity_threshold, cluster_count, payload, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(directory, scan_mode) DO UPDATE SET
                engine_version = excluded.engine_version,
                similarity_threshold = excluded.similarity_threshold,
                cluster_count = excluded.cluster_count,
                payload = excluded.payload,
                updated_at = CURRENT_TIMESTAMP
            "#,
            rusqlite::params![
                key.directory,
                key.scan_mode.as_str(),
                set.engine_version,
                set.similarity_threshold,
                set.clusters.len() as i64,
                payload,
            ],
        )?;
        Ok(())
    }

    fn remove(&self, key: &StoreKey) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM cluster_cache WHERE directory = ? AND scan_mode = ?",
            rusqlite::params![key.directory, key.scan_mode.as_str()],
        )?;
        Ok(deleted > 0)
    }

    fn rebuild_locks(&self) -> &RebuildLocks {
        &self.locks
    }
}
