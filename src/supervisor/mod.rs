//! Recorder supervisor: drives the booking lifecycle.
//!
//! A single control loop polls the booking cache every tick, watches the
//! cache file for change events as a fast path (the poll remains the
//! correctness backbone), starts and stops capture sessions, invokes the
//! merge engine synchronously after capture, and publishes markers.
//! Exactly one instance runs per host.

mod recovery;

pub use recovery::recover_stale_recordings;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use notify::Watcher;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::booking::{Booking, BookingCache, BookingStatus};
use crate::capture::{CaptureDriver, CaptureError};
use crate::config::Config;
use crate::merge::MergeEngine;
use crate::store::BookingStoreClient;
use crate::workspace::{self, Marker, RecordingDir};

/// Internal scheduler state: idle, or recording one booking
enum SupervisorState {
    Idle,
    Recording(ActiveRecording),
}

/// The in-flight session keeps its own copy of the booking, so removal
/// from the cache neither aborts nor shortens it.
struct ActiveRecording {
    booking: Booking,
    dir: RecordingDir,
}

/// Which bookings the supervisor selected and refused this tick
#[derive(Debug)]
pub struct Selection<'a> {
    pub active: Option<&'a Booking>,
    pub rejected: Vec<(&'a Booking, String)>,
}

/// Pick the unique active booking for `now`: the earliest `start_time`
/// wins, later overlapping bookings are rejected with a reason naming the
/// winner.
pub fn select_active<'a>(bookings: &'a [Booking], now: DateTime<Utc>) -> Selection<'a> {
    let mut candidates: Vec<&Booking> = bookings
        .iter()
        .filter(|b| b.contains(now) && b.status != Some(BookingStatus::Failed))
        .collect();
    candidates.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));

    let mut iter = candidates.into_iter();
    let active = iter.next();
    let rejected = match active {
        Some(winner) => iter
            .map(|b| (b, format!("overlap_with_{}", winner.id)))
            .collect(),
        None => Vec::new(),
    };

    Selection { active, rejected }
}

pub struct SupervisorEngine {
    config: Arc<Config>,
    cache: BookingCache,
    store: BookingStoreClient,
    driver: CaptureDriver,
    merge: MergeEngine,
    state: SupervisorState,
    /// Bookings already marked failed this run (expired, overlap, device
    /// errors), so a slow-updating cache does not refire the transition.
    handled: HashSet<String>,
}

impl SupervisorEngine {
    pub fn new(config: Arc<Config>) -> Self {
        let cache = BookingCache::new(
            config.cache_path(),
            config.supervisor.cache_alert_threshold,
        );
        let store = BookingStoreClient::new(&config);
        let driver = CaptureDriver::new(config.clone());
        let merge = MergeEngine::new(config.clone());
        Self {
            config,
            cache,
            store,
            driver,
            merge,
            state: SupervisorState::Idle,
            handled: HashSet::new(),
        }
    }

    /// Run the control loop until `shutdown` flips.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        std::fs::create_dir_all(&self.config.workspace_root)
            .context("Failed to create workspace root")?;

        let recovered =
            recover_stale_recordings(&self.config, &self.merge, &self.store).await;
        if recovered > 0 {
            info!(recovered, "Recovered stale recordings from a previous run");
        }

        // Change events on the cache file shorten reaction time; losing
        // them is harmless because every tick re-reads the cache anyway.
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel();
        let _watcher = self.spawn_cache_watcher(fs_tx);

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.supervisor.poll_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            workspace = %self.config.workspace_root.display(),
            cache = %self.cache.path().display(),
            "Supervisor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
                Some(()) = fs_rx.recv() => {
                    debug!("Booking cache changed, running early tick");
                    self.tick(Utc::now()).await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain().await;
        info!("Supervisor stopped");
        Ok(())
    }

    /// One tick and out, for `--once` runs in tests and provisioning
    pub async fn run_once(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.config.workspace_root)
            .context("Failed to create workspace root")?;
        recover_stale_recordings(&self.config, &self.merge, &self.store).await;
        self.tick(Utc::now()).await;
        self.drain().await;
        Ok(())
    }

    fn spawn_cache_watcher(
        &self,
        fs_tx: mpsc::UnboundedSender<()>,
    ) -> Option<notify::RecommendedWatcher> {
        let cache_path = self.cache.path().clone();
        let watch_dir = cache_path.parent()?.to_path_buf();
        if !watch_dir.exists() {
            return None;
        }

        let mut watcher = match notify::recommended_watcher(
            move |result: notify::Result<notify::Event>| {
                if let Ok(event) = result {
                    let relevant = event.paths.iter().any(|p| p == &cache_path);
                    if relevant
                        && (event.kind.is_create()
                            || event.kind.is_modify()
                            || event.kind.is_remove())
                    {
                        let _ = fs_tx.send(());
                    }
                }
            },
        ) {
            Ok(w) => w,
            Err(e) => {
                warn!("Cache watcher unavailable ({e}); relying on polling alone");
                return None;
            }
        };

        // The API replaces the file with a rename, so watch the directory
        if let Err(e) = watcher.watch(&watch_dir, notify::RecursiveMode::NonRecursive) {
            warn!("Cache watch failed ({e}); relying on polling alone");
            return None;
        }
        Some(watcher)
    }

    async fn tick(&mut self, now: DateTime<Utc>) {
        let bookings: Vec<Booking> = self.cache.refresh().to_vec();

        self.fail_expired(&bookings, now).await;

        // End conditions for an in-flight recording come first, so a
        // booking ending this tick frees the devices before a new one
        // starts.
        let mut end_reason = None;
        if let SupervisorState::Recording(ref active) = self.state {
            if now >= active.booking.end_time {
                end_reason = Some("window closed");
            }
        }
        if end_reason.is_none()
            && matches!(self.state, SupervisorState::Recording(_))
            && self.driver.session_unrecoverable()
        {
            end_reason = Some("capture unrecoverable");
        }
        if let Some(why) = end_reason {
            if let SupervisorState::Recording(ref active) = self.state {
                info!(booking_id = %active.booking.id, "Ending recording: {why}");
            }
            self.finish_active(now).await;
        }

        if matches!(self.state, SupervisorState::Idle) {
            let selection = select_active(&bookings, now);

            for (rejected, reason) in &selection.rejected {
                self.fail_booking_once(rejected, reason, now).await;
            }

            if let Some(booking) = selection.active {
                let already_done = self.handled.contains(&booking.id)
                    || matches!(
                        booking.status,
                        Some(BookingStatus::Completed)
                            | Some(BookingStatus::Processing)
                            | Some(BookingStatus::Uploaded)
                    );
                if !already_done {
                    self.start_recording(booking.clone(), now).await;
                }
            }
        }
    }

    /// Bookings whose window closed before they ever started end `failed`
    /// with reason "expired".
    async fn fail_expired(&mut self, bookings: &[Booking], now: DateTime<Utc>) {
        let expired: Vec<Booking> = bookings
            .iter()
            .filter(|b| {
                b.expired(now)
                    && matches!(b.status, None | Some(BookingStatus::Scheduled))
                    && !self.handled.contains(&b.id)
                    && !self.is_active(&b.id)
            })
            .cloned()
            .collect();

        for booking in expired {
            self.fail_booking_once(&booking, "expired", now).await;
        }
    }

    fn is_active(&self, booking_id: &str) -> bool {
        matches!(&self.state, SupervisorState::Recording(a) if a.booking.id == booking_id)
    }

    /// Mark a booking failed exactly once: `.error` marker, metadata
    /// reason, store update. No partial artifacts are produced.
    async fn fail_booking_once(&mut self, booking: &Booking, reason: &str, _now: DateTime<Utc>) {
        if !self.handled.insert(booking.id.clone()) {
            return;
        }
        warn!(booking_id = %booking.id, reason, "Booking failed");

        let dir = RecordingDir::for_booking(&self.config.workspace_root, booking.start_time, &booking.id);
        if dir.create().is_ok() {
            let _ = dir.update_metadata(|m| {
                m.booking_id = Some(booking.id.clone());
                m.user_id = Some(booking.user_id.clone());
                m.failure_reason = Some(reason.to_string());
            });
            let payload = serde_json::json!({ "reason": reason });
            let _ = dir.write_marker_json(Marker::Error, &payload);
        }

        if let Err(e) = self.store.mark_booking_failed(&booking.id, reason).await {
            warn!(booking_id = %booking.id, "Store update failed: {e}");
        }
    }

    async fn start_recording(&mut self, booking: Booking, now: DateTime<Utc>) {
        let dir = RecordingDir::for_booking(&self.config.workspace_root, booking.start_time, &booking.id);

        // Disk guard: a capture that would run the workspace dry fails
        // before it starts.
        if let Some(free) = workspace::free_space_bytes(&self.config.workspace_root) {
            if free < self.config.supervisor.disk_floor_bytes {
                error!(
                    free,
                    floor = self.config.supervisor.disk_floor_bytes,
                    "Refusing capture: workspace below free-space floor"
                );
                self.fail_booking_once(&booking, "disk_full", now).await;
                return;
            }
        }

        if let Err(e) = dir.create() {
            error!(booking_id = %booking.id, "Cannot create recording dir: {e}");
            self.fail_booking_once(&booking, "workspace_unwritable", now).await;
            return;
        }

        if dir.has_marker(Marker::Error) || dir.has_marker(Marker::Done) {
            debug!(booking_id = %booking.id, "Directory already processed, skipping");
            self.handled.insert(booking.id.clone());
            return;
        }

        // One supervisor per host: a pre-existing lock inside a still-open
        // window can only be a leftover from a crashed run. Take it over
        // and record the remainder of the window.
        if dir.has_marker(Marker::Lock) && !self.driver.has_session() {
            warn!(booking_id = %booking.id, "Taking over stale in-window lock");
            let _ = dir.clear_marker(Marker::Lock);
        }

        if let Err(e) = dir.write_marker(Marker::Lock) {
            // A live lock means another path is already recording this
            // booking; an impossible state for a single supervisor.
            error!(booking_id = %booking.id, "Lock create failed: {e}");
            return;
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let _ = dir.update_metadata(|m| {
            m.booking_id = Some(booking.id.clone());
            m.user_id = Some(booking.user_id.clone());
            m.session_id = Some(session_id);
            m.start_time = Some(booking.start_time);
            m.end_time = Some(booking.end_time);
        });

        // A booking starting in the past begins immediately with the
        // remaining, truncated duration.
        let duration = booking
            .remaining(now)
            .to_std()
            .unwrap_or(Duration::ZERO);

        let out_paths = [dir.cam_path(0), dir.cam_path(1)];
        match self.driver.start_session(&booking.id, duration, out_paths).await {
            Ok(start) => {
                info!(
                    booking_id = %booking.id,
                    skew_ms = start.skew_ms,
                    duration_secs = duration.as_secs(),
                    "Recording started"
                );
                let _ = dir.update_metadata(|m| m.start_skew_ms = Some(start.skew_ms));
                self.advance_status(&booking.id, BookingStatus::Recording).await;
                self.state = SupervisorState::Recording(ActiveRecording { booking, dir });
            }
            Err(CaptureError::Busy) => {
                // Internal state says idle but the driver disagrees; leave
                // the lock for crash recovery and surface loudly.
                error!(booking_id = %booking.id, "Driver busy while supervisor idle");
                let _ = dir.clear_marker(Marker::Lock);
            }
            Err(e) => {
                error!(booking_id = %booking.id, "Capture failed to start: {e}");
                let _ = dir.clear_marker(Marker::Lock);
                self.fail_booking_once(&booking, &format!("capture_start: {e}"), now)
                    .await;
            }
        }
    }

    /// Graceful end of the active session: stop capture, salvage what the
    /// cameras produced, publish `.done`, merge synchronously, advance
    /// status. Merge failure is not fatal here; the `.merge_error` marker
    /// carries it to the post-processor.
    async fn finish_active(&mut self, now: DateTime<Utc>) {
        let SupervisorState::Recording(active) = std::mem::replace(&mut self.state, SupervisorState::Idle)
        else {
            return;
        };
        let ActiveRecording { booking, dir } = active;

        let report = self.driver.stop_session().await;
        let _ = dir.clear_marker(Marker::Lock);

        let Some(report) = report else {
            error!(booking_id = %booking.id, "No session report after stop");
            self.fail_booking_once(&booking, "capture_lost", now).await;
            return;
        };

        let _ = dir.update_metadata(|m| {
            m.cameras = report
                .outcomes
                .iter()
                .enumerate()
                .map(|(i, o)| crate::workspace::CameraFileInfo {
                    file: crate::workspace::CAM_FILE_NAMES[i].to_string(),
                    size_bytes: o.size_bytes(),
                    duration_secs: None,
                })
                .collect();
        });

        if report.usable_count(self.config.capture.min_bytes) == 0 {
            self.fail_booking_once(&booking, "no usable capture output", now)
                .await;
            return;
        }

        self.handled.insert(booking.id.clone());

        if let Err(e) = dir.write_marker(Marker::Done) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                error!(booking_id = %booking.id, "Cannot publish .done: {e}");
                self.fail_booking_once(&booking, "marker_unwritable", now).await;
                return;
            }
        }

        // The per-directory lock keeps the post-processor's orphan path
        // off this recording while the synchronous merge runs.
        match dir.acquire_work_lock() {
            Some(_lock) => match self.merge.merge_recording(&dir).await {
                Ok(outcome) => {
                    info!(
                        booking_id = %booking.id,
                        method = outcome.method.as_str(),
                        "Merge complete"
                    );
                }
                Err(e) => {
                    warn!(booking_id = %booking.id, "Merge failed: {e}");
                }
            },
            None => {
                warn!(booking_id = %booking.id, "Recording locked elsewhere; leaving merge to its holder");
            }
        }

        self.advance_status(&booking.id, BookingStatus::Completed).await;
    }

    async fn advance_status(&self, booking_id: &str, status: BookingStatus) {
        let policy = crate::retry::RetryPolicy::from_config(&self.config.retry);
        let store = self.store.clone();
        let id = booking_id.to_string();
        let result = crate::retry::retry_async(policy, "booking status update", || {
            let store = store.clone();
            let id = id.clone();
            async move { store.update_booking_status(&id, status).await }
        })
        .await;
        if let Err(e) = result {
            warn!(booking_id, status = status.as_str(), "Status update failed: {e}");
        }
    }

    /// Bounded drain on shutdown: finish the in-flight recording if one
    /// exists. Exceeding the budget leaves `.lock` behind for crash
    /// recovery on the next start.
    async fn drain(&mut self) {
        if matches!(self.state, SupervisorState::Idle) {
            return;
        }
        let budget = Duration::from_secs(self.config.supervisor.drain_timeout_secs);
        info!("Draining in-flight recording (budget {budget:?})");
        if tokio::time::timeout(budget, self.finish_active(Utc::now()))
            .await
            .is_err()
        {
            warn!("Drain budget exceeded; leaving lock for crash recovery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn booking(id: &str, start: i64, end: i64) -> Booking {
        Booking {
            id: id.to_string(),
            user_id: "u1".to_string(),
            camera_id: None,
            start_time: Utc.timestamp_opt(start, 0).unwrap(),
            end_time: Utc.timestamp_opt(end, 0).unwrap(),
            status: None,
            email: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn no_candidates_selects_nothing() {
        let bookings = vec![booking("b1", 100, 200)];
        let selection = select_active(&bookings, at(250));
        assert!(selection.active.is_none());
        assert!(selection.rejected.is_empty());
    }

    #[test]
    fn single_active_booking_wins() {
        let bookings = vec![booking("b1", 100, 200), booking("b2", 300, 400)];
        let selection = select_active(&bookings, at(150));
        assert_eq!(selection.active.unwrap().id, "b1");
        assert!(selection.rejected.is_empty());
    }

    #[test]
    fn earliest_start_wins_overlap_and_rest_are_rejected() {
        // B1 [T, T+60], B2 [T+30, T+90]: at T+40 both are active
        let bookings = vec![booking("b2", 130, 190), booking("b1", 100, 160)];
        let selection = select_active(&bookings, at(140));
        assert_eq!(selection.active.unwrap().id, "b1");
        assert_eq!(selection.rejected.len(), 1);
        assert_eq!(selection.rejected[0].0.id, "b2");
        assert_eq!(selection.rejected[0].1, "overlap_with_b1");
    }

    #[test]
    fn equal_start_ties_break_by_id() {
        let bookings = vec![booking("z", 100, 200), booking("a", 100, 180)];
        let selection = select_active(&bookings, at(150));
        assert_eq!(selection.active.unwrap().id, "a");
        assert_eq!(selection.rejected[0].1, "overlap_with_a");
    }

    #[test]
    fn failed_bookings_are_not_candidates() {
        let mut failed = booking("b1", 100, 200);
        failed.status = Some(BookingStatus::Failed);
        let ok = booking("b2", 120, 220);
        let bookings = [failed, ok];
        let selection = select_active(&bookings, at(150));
        assert_eq!(selection.active.unwrap().id, "b2");
    }

    #[test]
    fn booking_started_in_past_truncates_duration() {
        let b = booking("b1", 100, 200);
        // Discovered 30s late: 70s remain
        assert_eq!(b.remaining(at(130)).num_seconds(), 70);
        // Not yet started: full window
        assert_eq!(b.remaining(at(50)).num_seconds(), 100);
    }
}
