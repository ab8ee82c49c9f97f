//! Index watcher for hot-reloading
//!
//! Polls the merged index metadata and swaps a freshly loaded engine into an
//! [`IndexHandle`] whenever a new index is published in the served directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::{IndexError, IndexResult};
use crate::vector::engine::IndexHandle;
use crate::vector::layout::IndexLayout;

/// Watches the metadata file and reloads the index when it changes
pub struct IndexWatcher {
    handle: Arc<IndexHandle>,
    meta_path: PathBuf,
    last_modified: Option<SystemTime>,
    check_interval: Duration,
}

impl IndexWatcher {
    pub fn new(handle: Arc<IndexHandle>, check_interval: Duration) -> Self {
        let meta_path = IndexLayout::new(handle.current().root()).merged_meta();
        let last_modified = modified_time(&meta_path);
        Self {
            handle,
            meta_path,
            last_modified,
            check_interval,
        }
    }

    /// Poll forever
    pub async fn watch(mut self) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            "Watching {} every {} seconds",
            self.meta_path.display(),
            self.check_interval.as_secs()
        );

        loop {
            ticker.tick().await;
            if let Err(e) = self.check_and_reload().await {
                error!("Error checking/reloading index: {e}");
            }
        }
    }

    /// Reloads when the metadata file changed since the last successful load.
    /// Returns whether a new engine was swapped in.
    pub async fn check_and_reload(&mut self) -> IndexResult<bool> {
        let Some(current_modified) = modified_time(&self.meta_path) else {
            debug!("No index metadata at {}", self.meta_path.display());
            return Ok(false);
        };
        if self.last_modified == Some(current_modified) {
            return Ok(false);
        }

        info!("Index metadata changed, reloading {}", self.meta_path.display());
        let handle = Arc::clone(&self.handle);
        let reloaded = tokio::task::spawn_blocking(move || handle.reload())
            .await
            .map_err(|e| IndexError::corrupt(&self.meta_path, format!("reload task failed: {e}")))?;

        match reloaded {
            Ok(engine) => {
                self.last_modified = Some(current_modified);
                info!(
                    "Serving index {} with {} vectors",
                    engine.fingerprint(),
                    engine.len()
                );
                Ok(true)
            }
            Err(e) => {
                // A merge may still be publishing; retried on the next tick
                warn!("Failed to reload index: {e}");
                Err(e)
            }
        }
    }
}

fn modified_time(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
