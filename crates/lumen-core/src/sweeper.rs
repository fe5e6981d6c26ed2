//! Periodic cleanup of cached results and artifact files.
//!
//! Runs on its own timer, independent of any session.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::artifacts::ArtifactStore;
use crate::cache::ResultCache;
use crate::config::CleanupConfig;
use crate::error::Result;

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub results_evicted: usize,
    pub files_deleted: usize,
}

#[derive(Debug, Clone)]
pub struct Sweeper {
    cache: Arc<ResultCache>,
    store: Arc<ArtifactStore>,
    config: CleanupConfig,
}

impl Sweeper {
    pub fn new(cache: Arc<ResultCache>, store: Arc<ArtifactStore>, config: CleanupConfig) -> Self {
        Self { cache, store, config }
    }

    /// Evict expired results, then delete expired files nothing unconsumed refers to.
    pub fn sweep_once(&self) -> Result<SweepReport> {
        let results_evicted = self.cache.evict_expired(self.config.result_ttl());
        let keep = self.cache.referenced_artifacts();
        let files_deleted = self.store.sweep(self.config.artifact_ttl(), &keep)?;
        Ok(SweepReport {
            results_evicted,
            files_deleted,
        })
    }

    /// Run `sweep_once` every `interval` until the handle is stopped or dropped.
    pub fn spawn(self) -> SweeperHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let interval = self.config.interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut stop_rx => break,
                }

                let sweeper = self.clone();
                match tokio::task::spawn_blocking(move || sweeper.sweep_once()).await {
                    Ok(Ok(report)) if report != SweepReport::default() => {
                        tracing::info!(
                            "Cleanup evicted {} results and {} artifact files",
                            report.results_evicted,
                            report.files_deleted
                        );
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("Cleanup sweep failed: {}", e),
                    Err(e) => tracing::warn!("Cleanup sweep panicked: {}", e),
                }
            }
            tracing::debug!("Cleanup sweeper stopped");
        });

        SweeperHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }
}

/// Stops the background sweeper when stopped or dropped.
pub struct SweeperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop after any sweep in progress and wait for the task to end.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
