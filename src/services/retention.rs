use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::sleep;

/// Periodically purges files in the upload directory older than the retention age.
///
/// Requests never delete produced workbooks; this is the only place they go away.
/// Outputs of requests that timed out after the update stage end up here too.
pub struct RetentionWorker {
    upload_dir: PathBuf,
    max_age: Duration,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl RetentionWorker {
    pub fn new(
        upload_dir: PathBuf,
        max_age: Duration,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            upload_dir,
            max_age,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            "🚀 Retention worker started (max age {:?}, every {:?})",
            self.max_age,
            self.interval
        );

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Retention worker shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    self.perform_sweep().await;
                }
            }
        }
    }

    async fn perform_sweep(&self) {
        let dir = self.upload_dir.clone();
        let max_age = self.max_age;
        let now = SystemTime::now();
        if let Some(cutoff) = now.checked_sub(max_age) {
            let cutoff: DateTime<Utc> = cutoff.into();
            tracing::debug!("🧹 Purging files last modified before {}", cutoff.to_rfc3339());
        }
        match tokio::task::spawn_blocking(move || sweep_expired(&dir, max_age, now))
            .await
        {
            Ok(0) => tracing::debug!("Retention sweep found nothing to remove"),
            Ok(removed) => tracing::info!("🧹 Retention sweep removed {} file(s)", removed),
            Err(e) => tracing::error!("Retention sweep task failed: {}", e),
        }
    }
}

/// Deletes regular files in `dir` last modified more than `max_age` before `now`.
/// Returns how many were removed. Subdirectories and unreadable entries are skipped.
pub fn sweep_expired(dir: &Path, max_age: Duration, now: SystemTime) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot read upload directory {}: {}", dir.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        let expired = now
            .duration_since(modified)
            .map(|age| age > max_age)
            .unwrap_or(false);
        if !expired {
            continue;
        }

        let path = entry.path();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Removed expired file {}", path.display());
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Could not remove expired file {}: {}", path.display(), e),
        }
    }
    removed
}
