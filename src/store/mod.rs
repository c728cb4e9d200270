//! Persistence of cluster sets, keyed by directory and scan mode.
//!
//! Stores are plain handles owned by the caller. A [`ClusterSession`] binds
//! one store to one key and runs builds and incremental updates against it.

mod schema;
pub mod sqlite;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::clustering::{
    self, BuildControl, BuildOutcome, Classification, Cluster, ClusterOptions, ImageRecord,
    RemovalOutcome,
};
use crate::error::{ClusterError, ClusterResult};

pub use sqlite::SqliteStore;

/// Bumped whenever clustering semantics change; older cached sets are
/// discarded wholesale.
pub const ENGINE_VERSION: u32 = 2;

/// Threshold values closer than this are treated as equal.
const THRESHOLD_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    #[default]
    Recursive,
    Flat,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Recursive => "recursive",
            ScanMode::Flat => "flat",
        }
    }
}

impl std::str::FromStr for ScanMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "recursive" => Ok(ScanMode::Recursive),
            "flat" => Ok(ScanMode::Flat),
            other => anyhow::bail!("unknown scan mode: {}", other),
        }
    }
}

/// Identity of a cached cluster set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreKey {
    pub directory: String,
    pub scan_mode: ScanMode,
}

impl StoreKey {
    pub fn new(directory: impl Into<String>, scan_mode: ScanMode) -> Self {
        Self {
            directory: directory.into(),
            scan_mode,
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.directory, self.scan_mode.as_str())
    }
}

/// The persisted output of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSet {
    pub engine_version: u32,
    pub similarity_threshold: f64,
    pub clusters: Vec<Cluster>,
    /// Epoch milliseconds.
    pub built_at: i64,
}

impl ClusterSet {
    pub fn new(clusters: Vec<Cluster>, similarity_threshold: f64) -> Self {
        Self {
            engine_version: ENGINE_VERSION,
            similarity_threshold,
            clusters,
            built_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Whether this set can be reused for `threshold` without a rebuild.
    pub fn is_valid_for(&self, threshold: f64) -> bool {
        self.engine_version == ENGINE_VERSION
            && (self.similarity_threshold - threshold).abs() < THRESHOLD_TOLERANCE
    }

    pub fn image_count(&self) -> usize {
        self.clusters.iter().map(Cluster::size).sum()
    }
}

/// Keys with a full rebuild in flight.
///
/// Every store owns one registry, so all sessions sharing a store handle see
/// the same locks regardless of which manager or task started the rebuild.
#[derive(Debug, Default)]
pub struct RebuildLocks {
    keys: Mutex<HashSet<StoreKey>>,
}

impl RebuildLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` until the returned guard is dropped.
    pub fn try_acquire(&self, key: &StoreKey) -> ClusterResult<RebuildGuard<'_>> {
        if !self.keys().insert(key.clone()) {
            return Err(ClusterError::RebuildInProgress(key.clone()));
        }
        Ok(RebuildGuard {
            locks: self,
            key: key.clone(),
        })
    }

    pub fn is_locked(&self, key: &StoreKey) -> bool {
        self.keys().contains(key)
    }

    // The set holds no invariant a panicking holder could break.
    fn keys(&self) -> MutexGuard<'_, HashSet<StoreKey>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases its key on drop, including while unwinding from a panic.
#[derive(Debug)]
pub struct RebuildGuard<'a> {
    locks: &'a RebuildLocks,
    key: StoreKey,
}

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.locks.keys().remove(&self.key);
    }
}

/// Backend for cached cluster sets.
pub trait ClusterStore: Send + Sync {
    /// Load the set stored under `key`, if any. Validity is up to the caller.
    fn load(&self, key: &StoreKey) -> Result<Option<ClusterSet>>;

    /// Replace the set stored under `key`.
    fn save(&self, key: &StoreKey, set: &ClusterSet) -> Result<()>;

    /// Delete the set stored under `key`. Returns true if one existed.
    fn remove(&self, key: &StoreKey) -> Result<bool>;

    /// Rebuild locks shared by every session on this store.
    fn rebuild_locks(&self) -> &RebuildLocks;
}

/// In-process store, mainly for hosts that persist elsewhere and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sets: Mutex<HashMap<StoreKey, ClusterSet>>,
    locks: RebuildLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClusterStore for MemoryStore {
    fn load(&self, key: &StoreKey) -> Result<Option<ClusterSet>> {
        let sets = self
            .sets
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(sets.get(key).cloned())
    }

    fn save(&self, key: &StoreKey, set: &ClusterSet) -> Result<()> {
        let mut sets = self
            .sets
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        sets.insert(key.clone(), set.clone());
        Ok(())
    }

    fn remove(&self, key: &StoreKey) -> Result<bool> {
        let mut sets = self
            .sets
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(sets.remove(key).is_some())
    }

    fn rebuild_locks(&self) -> &RebuildLocks {
        &self.locks
    }
}

/// A store handle bound to one directory key and one set of options.
#[derive(Clone)]
pub struct ClusterSession {
    store: Arc<dyn ClusterStore>,
    key: StoreKey,
    options: ClusterOptions,
}

impl ClusterSession {
    pub fn new(store: Arc<dyn ClusterStore>, key: StoreKey, options: ClusterOptions) -> Self {
        Self {
            store,
            key,
            options,
        }
    }

    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// The cached set, if present and built with the current engine and threshold.
    pub fn load_valid(&self) -> ClusterResult<Option<ClusterSet>> {
        let set = self.store.load(&self.key)?;
        Ok(set.filter(|s| {
            let valid = s.is_valid_for(self.options.threshold);
            if !valid {
                debug!(
                    key = %self.key,
                    cached_version = s.engine_version,
                    cached_threshold = s.similarity_threshold,
                    "Cached cluster set is stale"
                );
            }
            valid
        }))
    }

    /// Whether any session on this store is rebuilding this key.
    pub fn is_rebuilding(&self) -> bool {
        self.store.rebuild_locks().is_locked(&self.key)
    }

    /// Build from scratch and persist. Nothing is written unless the build
    /// completes, so a cancelled or failed rebuild leaves the old set in place.
    ///
    /// Fails with [`ClusterError::RebuildInProgress`] while another rebuild of
    /// the same key runs on the same store.
    pub fn rebuild(
        &self,
        images: &[ImageRecord],
        control: &BuildControl,
    ) -> ClusterResult<BuildOutcome> {
        let _guard = self.store.rebuild_locks().try_acquire(&self.key).inspect_err(|_| {
            warn!(key = %self.key, "Rejected rebuild request: one is already running");
        })?;
        let outcome = clustering::build_clusters_with(images, &self.options, control)?;
        control.checkpoint()?;

        let set = ClusterSet::new(outcome.clusters.clone(), self.options.threshold);
        self.store.save(&self.key, &set)?;
        info!(key = %self.key, clusters = set.clusters.len(), "Saved cluster set");
        Ok(outcome)
    }

    /// [`rebuild`](Self::rebuild) on tokio's blocking pool.
    pub async fn rebuild_async(
        &self,
        images: Vec<ImageRecord>,
        cancel: Arc<AtomicBool>,
    ) -> ClusterResult<BuildOutcome> {
        let session = self.clone();
        tokio::task::spawn_blocking(move || session.rebuild(&images, &BuildControl::new(&cancel)))
            .await
            .map_err(|e| ClusterError::Worker(e.to_string()))?
    }

    /// Return the cached set, rebuilding first when none is valid.
    pub fn load_or_rebuild(&self, images: &[ImageRecord]) -> ClusterResult<ClusterSet> {
        if let Some(set) = self.load_valid()? {
            return Ok(set);
        }
        let outcome = self.rebuild(images, &BuildControl::none())?;
        Ok(ClusterSet::new(outcome.clusters, self.options.threshold))
    }

    /// Classify one new image into the cached set and persist the change.
    pub fn add_image(&self, image: &ImageRecord) -> ClusterResult<Classification> {
        let mut set = self.require_valid()?;
        let classification = clustering::add_image(
            image,
            &mut set.clusters,
            self.options.threshold,
            &self.options.weights,
        )?;
        self.store.save(&self.key, &set)?;
        Ok(classification)
    }

    /// Remove deleted images from the cached set and persist the change.
    pub fn remove_images<I, S>(&self, deleted_ids: I) -> ClusterResult<RemovalOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = self.require_valid()?;
        let outcome = clustering::remove_images(deleted_ids, set.clusters);
        let updated = ClusterSet {
            clusters: outcome.clusters.clone(),
            ..set
        };
        self.store.save(&self.key, &updated)?;
        Ok(outcome)
    }

    fn require_valid(&self) -> ClusterResult<ClusterSet> {
        self.load_valid()?
            .ok_or_else(|| ClusterError::MissingClusterSet(self.key.clone()))
    }
}

impl fmt::Debug for ClusterSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSession")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::BuildPhase;
    use std::sync::atomic::Ordering;

    fn session(store: Arc<dyn ClusterStore>, threshold: f64) -> ClusterSession {
        ClusterSession::new(
            store,
            StoreKey::new("/photos", ScanMode::Recursive),
            ClusterOptions::with_threshold(threshold),
        )
    }

    fn images() -> Vec<ImageRecord> {
        vec![
            ImageRecord::new("x", Some("a cat sitting on a mat"), 1),
            ImageRecord::new("y", Some("a cat sitting on the mat"), 2),
            ImageRecord::new("z", Some("a spaceship launching"), 3),
        ]
    }

    #[test]
    fn test_cluster_set_validity() {
        let set = ClusterSet::new(Vec::new(), 0.85);
        assert!(set.is_valid_for(0.85));
        assert!(!set.is_valid_for(0.9));

        let old = ClusterSet {
            engine_version: ENGINE_VERSION + 1,
            ..set
        };
        assert!(!old.is_valid_for(0.85));
    }

    #[test]
    fn test_store_key_display() {
        let key = StoreKey::new("/photos", ScanMode::Flat);
        assert_eq!(key.to_string(), "/photos (flat)");
    }

    #[test]
    fn test_rebuild_persists() {
        let store = Arc::new(MemoryStore::new());
        let session = session(store.clone(), 0.85);
        assert!(session.load_valid().unwrap().is_none());

        let outcome = session.rebuild(&images(), &BuildControl::none()).unwrap();
        assert_eq!(outcome.clusters.len(), 2);

        let cached = session.load_valid().unwrap().unwrap();
        assert_eq!(cached.clusters, outcome.clusters);
        assert_eq!(cached.image_count(), 3);
    }

    #[test]
    fn test_threshold_change_invalidates() {
        let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::new());
        session(store.clone(), 0.85)
            .rebuild(&images(), &BuildControl::none())
            .unwrap();
        assert!(session(store, 0.9).load_valid().unwrap().is_none());
    }

    #[test]
    fn test_cancelled_rebuild_keeps_old_set() {
        let store = Arc::new(MemoryStore::new());
        let session = session(store, 0.85);
        session.rebuild(&images(), &BuildControl::none()).unwrap();
        let before = session.load_valid().unwrap().unwrap();

        let flag = std::sync::atomic::AtomicBool::new(true);
        let more = vec![ImageRecord::new("q", Some("a lighthouse"), 9)];
        let err = session.rebuild(&more, &BuildControl::new(&flag)).unwrap_err();
        assert!(matches!(err, ClusterError::Cancelled));
        assert_eq!(session.load_valid().unwrap().unwrap(), before);
    }

    #[test]
    fn test_cancel_raised_while_merging_keeps_old_set() {
        let store = Arc::new(MemoryStore::new());
        let session = session(store, 0.85);
        session.rebuild(&images(), &BuildControl::none()).unwrap();
        let before = session.load_valid().unwrap().unwrap();

        let flag = AtomicBool::new(false);
        let phases = Mutex::new(Vec::new());
        let progress = |phase: BuildPhase, _: usize, _: usize| {
            phases.lock().unwrap().push(phase);
            if phase == BuildPhase::Merging {
                flag.store(true, Ordering::SeqCst);
            }
        };
        let mut more = images();
        more.push(ImageRecord::new("q", Some("a lighthouse at night"), 9));
        let control = BuildControl::new(&flag).with_progress(&progress);

        let err = session.rebuild(&more, &control).unwrap_err();
        assert!(matches!(err, ClusterError::Cancelled));
        let phases = phases.into_inner().unwrap();
        assert!(phases.contains(&BuildPhase::Merging));
        assert!(!phases.contains(&BuildPhase::Refining));
        assert_eq!(session.load_valid().unwrap().unwrap(), before);
        assert!(!session.is_rebuilding());
    }

    #[test]
    fn test_rebuild_of_locked_key_rejected() {
        let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::new());
        let photos = session(store.clone(), 0.85);
        let flat = ClusterSession::new(
            store.clone(),
            StoreKey::new("/photos", ScanMode::Flat),
            ClusterOptions::default(),
        );

        let guard = store.rebuild_locks().try_acquire(photos.key()).unwrap();
        assert!(photos.is_rebuilding());
        let err = photos.rebuild(&images(), &BuildControl::none()).unwrap_err();
        assert!(matches!(err, ClusterError::RebuildInProgress(ref k) if k == photos.key()));
        assert!(photos.load_valid().unwrap().is_none());

        // Other keys on the same store are unaffected.
        assert!(!flat.is_rebuilding());
        flat.rebuild(&images(), &BuildControl::none()).unwrap();

        drop(guard);
        assert!(!photos.is_rebuilding());
        photos.rebuild(&images(), &BuildControl::none()).unwrap();
    }

    #[test]
    fn test_rebuild_started_during_rebuild_rejected() {
        let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::new());
        let outer = session(store.clone(), 0.85);
        // A separate session and caller, sharing only the store.
        let inner = session(store, 0.85);

        let nested = Mutex::new(Vec::new());
        let progress = |_: BuildPhase, _: usize, _: usize| {
            let result = inner.rebuild(&images(), &BuildControl::none());
            nested.lock().unwrap().push(result.map(|_| ()));
        };
        outer
            .rebuild(&images(), &BuildControl::none().with_progress(&progress))
            .unwrap();

        let nested = nested.into_inner().unwrap();
        assert!(!nested.is_empty());
        assert!(nested
            .iter()
            .all(|r| matches!(r, Err(ClusterError::RebuildInProgress(_)))));
        assert!(!outer.is_rebuilding());
        inner.rebuild(&images(), &BuildControl::none()).unwrap();
    }

    #[tokio::test]
    async fn test_async_rebuild_persists() {
        let store = Arc::new(MemoryStore::new());
        let session = session(store, 0.85);
        let outcome = session
            .rebuild_async(images(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(outcome.clusters.len(), 2);
        assert!(session.load_valid().unwrap().is_some());
    }

    #[test]
    fn test_incremental_updates_persist() {
        let store = Arc::new(MemoryStore::new());
        let session = session(store, 0.85);
        assert!(matches!(
            session.add_image(&ImageRecord::new("q", Some("cat"), 1)),
            Err(ClusterError::MissingClusterSet(_))
        ));

        session.load_or_rebuild(&images()).unwrap();
        let added = session
            .add_image(&ImageRecord::new("w", Some("a spaceship launching"), 4))
            .unwrap();
        assert!(!added.is_new_cluster);

        let removed = session.remove_images(["z", "w"]).unwrap();
        assert_eq!(removed.removed_clusters, 1);
        let cached = session.load_valid().unwrap().unwrap();
        assert_eq!(cached.clusters.len(), 1);
        assert_eq!(cached.image_count(), 2);
    }
}
