//! Best-effort removal of staged input files.
//!
//! Staged inputs are owned by a [`CleanupGuard`]. The pipeline releases the
//! guard explicitly once it reaches a terminal state; if the owning future is
//! dropped first (request timeout, staging failure) the guard's `Drop` runs the
//! same removal. Either way removal happens exactly once and never fails.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Removes each path that still exists. Failures are logged and skipped.
pub fn remove_all<P: AsRef<Path>>(paths: &[P]) {
    for path in paths {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!("Removed staged file {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Could not clean up file {}: {}", path.display(), e),
        }
    }
}

#[derive(Debug, Default)]
pub struct CleanupGuard {
    paths: Vec<PathBuf>,
    released: bool,
}

impl CleanupGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a path before it is written, so partial writes are covered too.
    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    /// Removes every tracked path now.
    pub fn release(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        remove_all(&self.paths);
        tracing::info!("Cleaned up {} temporary file(s)", self.paths.len());
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!("Staged files released without explicit cleanup, removing them now");
            self.run();
        }
    }
}
