use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::fs::FileSystem;

/// Monotonic counter advanced each time a transfer's cleanup begins.
///
/// Shared by every connection of a server so that a deferred deletion from
/// an old transfer cannot remove files belonging to a newer one.
#[derive(Debug, Clone, Default)]
pub struct CleanupGeneration(Arc<AtomicU64>);

impl CleanupGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the counter and returns the new value.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Performed,
    /// A later cleanup began before this one ran.
    Superseded,
}

/// Deferred deletion of a concluded transfer's leftovers.
pub struct CleanupTask {
    generation: CleanupGeneration,
    captured: u64,
    paths: Vec<PathBuf>,
    fs: Arc<dyn FileSystem>,
}

impl CleanupTask {
    /// Advances `generation` and captures the new value.
    pub(crate) fn begin(
        generation: &CleanupGeneration,
        paths: Vec<PathBuf>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            captured: generation.advance(),
            generation: generation.clone(),
            paths,
            fs,
        }
    }

    pub fn generation(&self) -> u64 {
        self.captured
    }

    /// Deletes the captured paths that still exist, unless superseded.
    pub fn run(self) -> CleanupOutcome {
        if !self.generation.is_current(self.captured) {
            debug!(
                generation = self.captured,
                current = self.generation.current(),
                "cleanup superseded"
            );
            return CleanupOutcome::Superseded;
        }

        for path in &self.paths {
            if !self.fs.exists(path) {
                continue;
            }
            match self.fs.remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed transfer leftover"),
                Err(e) => warn!(path = %path.display(), "failed to remove transfer leftover: {e}"),
            }
        }
        CleanupOutcome::Performed
    }
}
