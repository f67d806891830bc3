//! Post-processor: watches the workspace for merged recordings and turns
//! them into branded, uploaded finals.
//!
//! A bounded worker pool processes independent recordings in parallel;
//! each worker holds its directory's `O_EXCL` lock so multiple
//! post-processor processes can share a workspace without racing. The
//! deferred-retry queue drains on the same cadence, oldest-first.

mod pipeline;
mod retry_queue;

pub use pipeline::Pipeline;
pub use retry_queue::{RetryQueue, RetryRecord, RetryStage};

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::merge::MergeEngine;
use crate::store::BookingStoreClient;
use crate::upload::ObjectStoreClient;
use crate::workspace::{self, Marker, RecordingDir};

pub struct PostProcessor {
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
    merge: Arc<MergeEngine>,
    queue: RetryQueue,
    semaphore: Arc<Semaphore>,
}

impl PostProcessor {
    pub fn new(config: Arc<Config>) -> Self {
        let store = BookingStoreClient::new(&config);
        let object_store = ObjectStoreClient::new(&config);
        let queue = RetryQueue::new(&config.workspace_root);
        let pipeline = Arc::new(Pipeline::new(
            config.clone(),
            store,
            object_store,
            queue.clone(),
        ));
        let merge = Arc::new(MergeEngine::new(config.clone()));
        let semaphore = Arc::new(Semaphore::new(config.postprocess.workers));
        Self {
            config,
            pipeline,
            merge,
            queue,
            semaphore,
        }
    }

    /// Run the watch loop until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        std::fs::create_dir_all(&self.config.workspace_root)
            .context("Failed to create workspace root")?;

        let mut tasks = JoinSet::new();
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.postprocess.scan_interval_secs,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            workspace = %self.config.workspace_root.display(),
            workers = self.config.postprocess.workers,
            "Post-processor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan(&mut tasks).await;
                    self.drain_queue(&mut tasks).await;
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        warn!("Worker task panicked: {e}");
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain_workers(&mut tasks).await;
        info!("Post-processor stopped");
        Ok(())
    }

    /// One scan and queue drain, then wait for the workers. For `--once`.
    pub async fn run_once(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config.workspace_root)
            .context("Failed to create workspace root")?;
        let mut tasks = JoinSet::new();
        self.scan(&mut tasks).await;
        self.drain_queue(&mut tasks).await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Worker task panicked: {e}");
            }
        }
        Ok(())
    }

    /// Find recordings ready for post-processing and dispatch workers.
    async fn scan(&self, tasks: &mut JoinSet<()>) {
        for dir in workspace::scan_recording_dirs(&self.config.workspace_root) {
            if dir.has_marker(Marker::Error) {
                continue;
            }

            if let Some(problem) = dir.marker_corruption() {
                let booking_id = dir.booking_id().unwrap_or("unknown").to_string();
                self.pipeline
                    .fail_terminal(&dir, &booking_id, &format!("marker corruption: {problem}"))
                    .await;
                continue;
            }

            if dir.has_marker(Marker::Completed) {
                continue;
            }

            if !dir.has_marker(Marker::Done) {
                // Capture still running or never happened; skip without
                // locking (racing writers are expected here).
                continue;
            }

            let booking_id = dir.booking_id().unwrap_or("unknown").to_string();
            if self.queue.contains(&booking_id) {
                // The retry queue owns this recording until it drains
                continue;
            }

            let merged = dir.has_marker(Marker::Merged);
            let merge_error = dir.has_marker(Marker::MergeError);

            if merged || merge_error {
                self.dispatch_process(tasks, dir).await;
            } else if !dir.has_marker(Marker::Lock) {
                // Orphan: capture finished but the supervisor died before
                // merging. Merge here; the next scan picks up the result.
                self.dispatch_orphan_merge(tasks, dir).await;
            }
        }
    }

    async fn dispatch_process(&self, tasks: &mut JoinSet<()>, dir: RecordingDir) {
        let Some(lock) = dir.acquire_work_lock() else {
            debug!("{:?} locked by another worker, skipping", dir.path());
            return;
        };
        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            return;
        };
        let pipeline = self.pipeline.clone();
        tasks.spawn(async move {
            let _lock = lock;
            let _permit = permit;
            if let Err(e) = pipeline.process(&dir).await {
                warn!("Post-processing {:?} failed: {e}", dir.path());
            }
        });
    }

    async fn dispatch_orphan_merge(&self, tasks: &mut JoinSet<()>, dir: RecordingDir) {
        let Some(lock) = dir.acquire_work_lock() else {
            return;
        };
        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            return;
        };
        let merge = self.merge.clone();
        tasks.spawn(async move {
            let _lock = lock;
            let _permit = permit;
            info!("Merging orphaned recording {:?}", dir.path());
            if let Err(e) = merge.merge_recording(&dir).await {
                warn!("Orphan merge failed for {:?}: {e}", dir.path());
            }
        });
    }

    /// Dispatch due retry records, oldest-first. Records are taken off the
    /// queue before the attempt; failures re-enqueue themselves.
    async fn drain_queue(&self, tasks: &mut JoinSet<()>) {
        for record in self.queue.due(Utc::now()) {
            if let Err(e) = self.queue.remove(&record.booking_id) {
                warn!(booking_id = %record.booking_id, "Cannot take retry record: {e}");
                continue;
            }
            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                return;
            };
            let pipeline = self.pipeline.clone();
            tasks.spawn(async move {
                let _permit = permit;
                info!(
                    booking_id = %record.booking_id,
                    attempt = record.attempt,
                    stage = ?record.stage,
                    "Draining deferred retry"
                );
                if let Err(e) = pipeline.upload_and_complete(record).await {
                    warn!("Deferred retry failed: {e}");
                }
            });
        }
    }

    /// Bounded wait for in-flight workers at shutdown
    async fn drain_workers(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        let budget = Duration::from_secs(self.config.supervisor.drain_timeout_secs);
        info!(
            in_flight = tasks.len(),
            "Draining post-processing workers (budget {budget:?})"
        );
        let drain = async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Worker task panicked: {e}");
                }
            }
        };
        if tokio::time::timeout(budget, drain).await.is_err() {
            warn!("Drain budget exceeded; aborting remaining workers");
            tasks.abort_all();
        }
    }
}
