//! Background rebuild management.
//!
//! Full rebuilds run on worker threads so the host stays responsive. At most
//! one rebuild per store key is in flight; progress and completion are
//! reported over channels and collected by polling.

pub mod manager;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clustering::BuildPhase;
use crate::store::StoreKey;

pub use manager::RebuildManager;

/// Unique identifier for a background rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

/// Latest progress report of a running rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildProgress {
    pub phase: BuildPhase,
    pub current: usize,
    pub total: usize,
}

impl RebuildProgress {
    /// Share of the current phase done, 0-100.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            (self.current.min(self.total) * 100 / self.total) as u8
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Cancelled,
    Failed(String),
}

/// Messages from a rebuild worker to its manager.
#[derive(Debug, Clone)]
enum RebuildUpdate {
    Progress(RebuildProgress),
    Finished { state: TaskState, message: String },
}

/// A rebuild the manager is tracking.
#[derive(Debug)]
pub struct RebuildTask {
    pub id: TaskId,
    pub key: StoreKey,
    pub progress: Option<RebuildProgress>,
    state: TaskState,
    cancel_flag: Arc<AtomicBool>,
    receiver: mpsc::Receiver<RebuildUpdate>,
    started_at: Instant,
}

impl RebuildTask {
    fn new(
        id: TaskId,
        key: StoreKey,
        cancel_flag: Arc<AtomicBool>,
        receiver: mpsc::Receiver<RebuildUpdate>,
    ) -> Self {
        Self {
            id,
            key,
            progress: None,
            state: TaskState::Running,
            cancel_flag,
            receiver,
            started_at: Instant::now(),
        }
    }

    fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }
}

/// A finished rebuild, as returned by polling.
#[derive(Debug, Clone)]
pub struct RebuildCompletion {
    pub id: TaskId,
    pub key: StoreKey,
    pub message: String,
    pub state: TaskState,
}

impl RebuildCompletion {
    pub fn success(&self) -> bool {
        self.state == TaskState::Completed
    }
}
