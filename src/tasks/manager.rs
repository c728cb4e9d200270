//! Tracks rebuild workers and enforces one rebuild per store key.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{RebuildCompletion, RebuildProgress, RebuildTask, RebuildUpdate, TaskId, TaskState};
use crate::clustering::{BuildControl, BuildPhase, ImageRecord};
use crate::error::{ClusterError, ClusterResult};
use crate::store::{ClusterSession, StoreKey};

/// Manages all background rebuilds, providing centralized control and status.
pub struct RebuildManager {
    tasks: HashMap<TaskId, RebuildTask>,
    /// Start order, for display.
    task_order: Vec<TaskId>,
}

impl RebuildManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            task_order: Vec::new(),
        }
    }

    /// Check if this manager is running a rebuild for `key`.
    pub fn is_running(&self, key: &StoreKey) -> bool {
        self.tasks.values().any(|t| &t.key == key && t.is_running())
    }

    /// Start a full rebuild for the session's key on a worker thread.
    ///
    /// A request is rejected while this manager still tracks a rebuild for the
    /// key, or while any other caller is rebuilding it on the same store. The
    /// session's store is only written when the rebuild completes.
    pub fn start_rebuild(
        &mut self,
        session: ClusterSession,
        images: Vec<ImageRecord>,
    ) -> ClusterResult<TaskId> {
        let key = session.key().clone();
        if self.is_running(&key) || session.is_rebuilding() {
            warn!(key = %key, "Rejected rebuild request: one is already running");
            return Err(ClusterError::RebuildInProgress(key));
        }

        let (tx, rx) = mpsc::channel();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let id = TaskId::next();

        let worker_flag = cancel_flag.clone();
        std::thread::Builder::new()
            .name(format!("rebuild-{}", id.0))
            .spawn(move || run_rebuild(session, images, tx, worker_flag))
            .map_err(|e| ClusterError::Worker(e.to_string()))?;

        self.tasks
            .insert(id, RebuildTask::new(id, key.clone(), cancel_flag, rx));
        self.task_order.push(id);

        info!(key = %key, task = id.0, "Started rebuild");
        Ok(id)
    }

    /// Cancel a specific task by ID.
    pub fn cancel_task(&mut self, id: TaskId) -> bool {
        match self.tasks.get(&id) {
            Some(task) if task.is_running() => {
                task.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel the running rebuild for `key`, if any.
    pub fn cancel_key(&mut self, key: &StoreKey) -> bool {
        let mut cancelled = false;
        for task in self.tasks.values() {
            if &task.key == key && task.is_running() {
                task.cancel();
                cancelled = true;
            }
        }
        cancelled
    }

    /// Poll all task channels for updates.
    /// Returns one entry per task that finished since the last poll.
    ///
    /// A worker that hangs up without a final report (it panicked) is
    /// reported as failed so its key can be rebuilt again.
    pub fn poll_updates(&mut self) -> Vec<RebuildCompletion> {
        let mut completed = Vec::new();

        for task in self.tasks.values_mut() {
            let finished = loop {
                match task.receiver.try_recv() {
                    Ok(RebuildUpdate::Progress(progress)) => task.progress = Some(progress),
                    Ok(RebuildUpdate::Finished { state, message }) => break Some((state, message)),
                    Err(TryRecvError::Empty) => break None,
                    Err(TryRecvError::Disconnected) => {
                        error!(
                            key = %task.key,
                            task = task.id.0,
                            "Rebuild worker exited without reporting"
                        );
                        let message = "rebuild worker exited without reporting".to_string();
                        break Some((TaskState::Failed(message.clone()), message));
                    }
                }
            };

            if let Some((state, message)) = finished {
                task.state = state.clone();
                completed.push(RebuildCompletion {
                    id: task.id,
                    key: task.key.clone(),
                    message,
                    state,
                });
            }
        }

        for done in &completed {
            self.tasks.remove(&done.id);
            self.task_order.retain(|id| *id != done.id);
        }

        completed
    }

    /// Get all running tasks for display.
    pub fn running_tasks(&self) -> Vec<&RebuildTask> {
        self.task_order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.is_running())
            .collect()
    }

    pub fn has_running_tasks(&self) -> bool {
        self.tasks.values().any(|t| t.is_running())
    }
}

impl Default for RebuildManager {
    fn default() -> Self {
        Self::new()
    }
}

fn run_rebuild(
    session: ClusterSession,
    images: Vec<ImageRecord>,
    tx: mpsc::Sender<RebuildUpdate>,
    cancel_flag: Arc<AtomicBool>,
) {
    let report = |phase: BuildPhase, current: usize, total: usize| {
        let _ = tx.send(RebuildUpdate::Progress(RebuildProgress {
            phase,
            current,
            total,
        }));
    };
    let control = BuildControl::new(&cancel_flag).with_progress(&report);

    let (state, message) = match session.rebuild(&images, &control) {
        Ok(outcome) => {
            let mut msg = format!(
                "Built {} clusters from {} images",
                outcome.clusters.len(),
                outcome.stats.images - outcome.stats.skipped_no_prompt
            );
            if outcome.stats.skipped_no_prompt > 0 {
                msg.push_str(&format!(
                    " ({} without prompt)",
                    outcome.stats.skipped_no_prompt
                ));
            }
            if !outcome.oversized.is_empty() {
                msg.push_str(&format!(" ({} oversized)", outcome.oversized.len()));
            }
            (TaskState::Completed, msg)
        }
        Err(ClusterError::Cancelled) => {
            info!(key = %session.key(), "Rebuild cancelled; previous clusters kept");
            (TaskState::Cancelled, "Cancelled".to_string())
        }
        Err(e) => (TaskState::Failed(e.to_string()), e.to_string()),
    };

    let _ = tx.send(RebuildUpdate::Finished { state, message });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::ClusterOptions;
    use crate::store::{ClusterSet, ClusterStore, MemoryStore, RebuildLocks, ScanMode};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    fn session(store: Arc<dyn ClusterStore>) -> ClusterSession {
        ClusterSession::new(
            store,
            StoreKey::new("/photos", ScanMode::Recursive),
            ClusterOptions::default(),
        )
    }

    fn images() -> Vec<ImageRecord> {
        vec![
            ImageRecord::new("x", Some("a cat sitting on a mat"), 1),
            ImageRecord::new("y", Some("a cat sitting on a mat"), 2),
        ]
    }

    fn wait_for(manager: &mut RebuildManager) -> Vec<RebuildCompletion> {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let done = manager.poll_updates();
            if !done.is_empty() || Instant::now() > deadline {
                return done;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Panics on the first save, then behaves like a memory store.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        panicked: AtomicBool,
    }

    impl ClusterStore for FlakyStore {
        fn load(&self, key: &StoreKey) -> anyhow::Result<Option<ClusterSet>> {
            self.inner.load(key)
        }

        fn save(&self, key: &StoreKey, set: &ClusterSet) -> anyhow::Result<()> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("disk went away mid-save");
            }
            self.inner.save(key, set)
        }

        fn remove(&self, key: &StoreKey) -> anyhow::Result<bool> {
            self.inner.remove(key)
        }

        fn rebuild_locks(&self) -> &RebuildLocks {
            self.inner.rebuild_locks()
        }
    }

    #[test]
    fn test_rebuild_completes_and_saves() {
        let store = Arc::new(MemoryStore::new());
        let mut manager = RebuildManager::new();

        manager.start_rebuild(session(store.clone()), images()).unwrap();
        let done = wait_for(&mut manager);
        assert_eq!(done.len(), 1);
        assert!(done[0].success(), "{}", done[0].message);
        assert!(!manager.has_running_tasks());

        let key = StoreKey::new("/photos", ScanMode::Recursive);
        let set = store.load(&key).unwrap().unwrap();
        assert_eq!(set.clusters.len(), 1);
    }

    #[test]
    fn test_second_rebuild_for_same_key_rejected() {
        let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::new());
        let mut manager = RebuildManager::new();

        // Register a task by hand so it is guaranteed to still be running.
        let (_tx, rx) = mpsc::channel();
        let key = StoreKey::new("/photos", ScanMode::Recursive);
        let id = TaskId::next();
        let task = RebuildTask::new(id, key.clone(), Arc::new(AtomicBool::new(false)), rx);
        manager.tasks.insert(id, task);
        manager.task_order.push(id);

        let err = manager.start_rebuild(session(store.clone()), Vec::new()).unwrap_err();
        assert!(matches!(err, ClusterError::RebuildInProgress(k) if k == key));

        // A different scan mode is a different key.
        let flat = ClusterSession::new(
            store,
            StoreKey::new("/photos", ScanMode::Flat),
            ClusterOptions::default(),
        );
        assert!(manager.start_rebuild(flat, Vec::new()).is_ok());

        assert!(manager.cancel_key(&key));
        assert!(manager.cancel_task(id));
    }

    #[test]
    fn test_rebuild_locked_elsewhere_rejected() {
        let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::new());
        let key = StoreKey::new("/photos", ScanMode::Recursive);
        let mut first = RebuildManager::new();
        let mut second = RebuildManager::new();

        // A rebuild running outside either manager.
        let guard = store.rebuild_locks().try_acquire(&key).unwrap();
        let err = first.start_rebuild(session(store.clone()), images()).unwrap_err();
        assert!(matches!(err, ClusterError::RebuildInProgress(_)));
        drop(guard);

        first.start_rebuild(session(store.clone()), images()).unwrap();
        // Whatever the second manager sees, the store never runs two at once.
        match second.start_rebuild(session(store.clone()), images()) {
            Ok(_) => {
                let mut results = wait_for(&mut first);
                results.extend(wait_for(&mut second));
                assert_eq!(results.len(), 2);
            }
            Err(e) => assert!(matches!(e, ClusterError::RebuildInProgress(_))),
        }
    }

    #[test]
    fn test_worker_panic_reports_failure_and_frees_key() {
        let store: Arc<dyn ClusterStore> = Arc::new(FlakyStore::default());
        let mut manager = RebuildManager::new();
        let key = StoreKey::new("/photos", ScanMode::Recursive);

        manager.start_rebuild(session(store.clone()), images()).unwrap();
        let done = wait_for(&mut manager);
        assert_eq!(done.len(), 1);
        assert!(matches!(done[0].state, TaskState::Failed(_)));
        assert!(!manager.is_running(&key));
        assert!(!session(store.clone()).is_rebuilding());

        manager.start_rebuild(session(store.clone()), images()).unwrap();
        let done = wait_for(&mut manager);
        assert!(done[0].success(), "{}", done[0].message);
        assert!(store.load(&key).unwrap().is_some());
    }

    #[test]
    fn test_cancelled_rebuild_reports_cancelled() {
        let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::new());
        let session = session(store.clone());
        let (tx, rx) = mpsc::channel();
        let flag = Arc::new(AtomicBool::new(true));

        run_rebuild(
            session.clone(),
            vec![ImageRecord::new("x", Some("a cat"), 1)],
            tx,
            flag,
        );

        let updates: Vec<RebuildUpdate> = rx.try_iter().collect();
        assert!(matches!(
            updates.last(),
            Some(RebuildUpdate::Finished {
                state: TaskState::Cancelled,
                ..
            })
        ));
        assert!(store.load(session.key()).unwrap().is_none());
    }
}
