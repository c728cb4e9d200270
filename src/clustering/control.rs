//! Cancellation and progress hooks threaded through a build.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ClusterError, ClusterResult};

/// Pipeline stage, reported alongside progress counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    ExactGrouping,
    Keywords,
    Bucketing,
    Merging,
    Refining,
}

impl BuildPhase {
    pub fn display_name(&self) -> &'static str {
        match self {
            BuildPhase::ExactGrouping => "Grouping identical prompts",
            BuildPhase::Keywords => "Extracting keywords",
            BuildPhase::Bucketing => "Bucketing",
            BuildPhase::Merging => "Merging similar prompts",
            BuildPhase::Refining => "Ordering clusters",
        }
    }
}

type ProgressFn<'a> = dyn Fn(BuildPhase, usize, usize) + Sync + 'a;

/// Borrowed view of a caller's cancel flag and progress callback.
#[derive(Clone, Copy, Default)]
pub struct BuildControl<'a> {
    cancel: Option<&'a AtomicBool>,
    progress: Option<&'a ProgressFn<'a>>,
}

impl<'a> BuildControl<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(cancel: &'a AtomicBool) -> Self {
        Self {
            cancel: Some(cancel),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: &'a ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Yield point: bail out if cancellation was requested.
    pub fn checkpoint(&self) -> ClusterResult<()> {
        if self.is_cancelled() {
            Err(ClusterError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn report(&self, phase: BuildPhase, current: usize, total: usize) {
        if let Some(progress) = self.progress {
            progress(phase, current, total);
        }
    }
}

impl std::fmt::Debug for BuildControl<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildControl")
            .field("cancelled", &self.is_cancelled())
            .field("has_progress", &self.progress.is_some())
            .finish()
    }
}
