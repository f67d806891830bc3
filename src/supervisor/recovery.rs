//! Crash recovery: stale `.lock` directories from a previous run.
//!
//! A supervisor killed mid-recording leaves `.lock` behind. On the next
//! start, any lock whose booking window closed (plus the grace period) is
//! stale: the lock is removed, salvageable camera files are merged, and
//! the on-disk state machine is moved forward to `.done`/`.merged` or
//! `.error`, exactly as a clean stop would have.

use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

use crate::booking::BookingStatus;
use crate::config::Config;
use crate::merge::MergeEngine;
use crate::store::BookingStoreClient;
use crate::workspace::{self, Marker, RecordingDir};

/// A lock directory with no usable window metadata is considered stale
/// once the lock file itself is this old.
const UNKNOWN_WINDOW_STALE: Duration = Duration::from_secs(24 * 3600);

/// Scan the workspace and recover every stale lock. Returns how many
/// directories were recovered.
pub async fn recover_stale_recordings(
    config: &Config,
    merge: &MergeEngine,
    store: &BookingStoreClient,
) -> usize {
    let mut recovered = 0;

    for dir in workspace::scan_recording_dirs(&config.workspace_root) {
        if let Some(problem) = dir.marker_corruption() {
            surface_corruption(&dir, &problem, store).await;
            continue;
        }

        if !dir.has_marker(Marker::Lock) {
            continue;
        }
        if !is_stale(&dir, config) {
            // A fresh lock belongs to a live session only when another
            // supervisor holds it; with one instance per host it means we
            // crashed moments ago, and the window may still be open. Leave
            // it for a later scan.
            continue;
        }

        let booking_id = dir.booking_id().unwrap_or("unknown").to_string();
        info!(booking_id, "Recovering stale recording at {:?}", dir.path());

        if let Err(e) = dir.clear_marker(Marker::Lock) {
            warn!(booking_id, "Cannot clear stale lock: {e}");
            continue;
        }

        let min_bytes = config.capture.min_bytes;
        let usable = (0..2)
            .filter(|&i| {
                std::fs::metadata(dir.cam_path(i))
                    .map(|m| m.len() >= min_bytes)
                    .unwrap_or(false)
            })
            .count();

        if usable == 0 {
            let _ = dir.update_metadata(|m| {
                m.failure_reason = Some("no usable capture output after crash".into());
            });
            let payload = serde_json::json!({ "reason": "no usable capture output after crash" });
            let _ = dir.write_marker_json(Marker::Error, &payload);
            if let Err(e) = store
                .mark_booking_failed(&booking_id, "no usable capture output after crash")
                .await
            {
                warn!(booking_id, "Store update failed during recovery: {e}");
            }
            recovered += 1;
            continue;
        }

        if let Err(e) = dir.ensure_marker(Marker::Done) {
            warn!(booking_id, "Cannot publish .done during recovery: {e}");
            continue;
        }

        let Some(_lock) = dir.acquire_work_lock() else {
            warn!(booking_id, "Recording locked elsewhere; skipping recovery merge");
            continue;
        };
        match merge.merge_recording(&dir).await {
            Ok(outcome) => {
                info!(
                    booking_id,
                    method = outcome.method.as_str(),
                    "Recovered recording merged"
                );
                if let Err(e) = store
                    .update_booking_status(&booking_id, BookingStatus::Completed)
                    .await
                {
                    warn!(booking_id, "Store update failed during recovery: {e}");
                }
            }
            Err(e) => {
                // .merge_error is already on disk; the post-processor
                // turns it into a terminal failure.
                warn!(booking_id, "Recovered recording failed to merge: {e}");
            }
        }
        recovered += 1;
    }

    recovered
}

/// Stale when now is past the recorded window end plus grace; without a
/// recorded window, when the lock file itself has aged out.
fn is_stale(dir: &RecordingDir, config: &Config) -> bool {
    let metadata = dir.load_metadata();
    if let Some(end) = metadata.end_time {
        let grace = chrono::Duration::seconds(config.capture.grace_secs as i64);
        return Utc::now() > end + grace;
    }

    std::fs::metadata(dir.marker_path(Marker::Lock))
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .map(|age| age > UNKNOWN_WINDOW_STALE)
        .unwrap_or(true)
}

async fn surface_corruption(dir: &RecordingDir, problem: &str, store: &BookingStoreClient) {
    if dir.has_marker(Marker::Error) {
        return;
    }
    warn!("Marker corruption in {:?}: {problem}", dir.path());
    let _ = dir.update_metadata(|m| {
        m.failure_reason = Some(format!("marker corruption: {problem}"));
    });
    let payload = serde_json::json!({ "reason": format!("marker corruption: {problem}") });
    let _ = dir.write_marker_json(Marker::Error, &payload);
    if let Some(booking_id) = dir.booking_id() {
        if let Err(e) = store.mark_booking_failed(booking_id, "marker corruption").await {
            warn!(booking_id, "Store update failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn setup(root: &std::path::Path) -> (Arc<Config>, MergeEngine, BookingStoreClient) {
        let mut config = Config::default();
        config.workspace_root = root.to_path_buf();
        let config = Arc::new(config);
        (
            config.clone(),
            MergeEngine::new(config.clone()),
            BookingStoreClient::new(&config),
        )
    }

    fn locked_dir(root: &std::path::Path, id: &str, end_offset_secs: i64) -> RecordingDir {
        let start = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        let dir = RecordingDir::for_booking(root, start, id);
        dir.create().unwrap();
        dir.write_marker(Marker::Lock).unwrap();
        let end = Utc::now() + chrono::Duration::seconds(end_offset_secs);
        dir.update_metadata(|m| {
            m.booking_id = Some(id.to_string());
            m.end_time = Some(end);
        })
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn stale_lock_without_usable_files_errors_out() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, merge, store) = setup(tmp.path());
        // Window closed two minutes ago, no camera files at all
        let dir = locked_dir(tmp.path(), "bk_crash", -120);

        let recovered = recover_stale_recordings(&config, &merge, &store).await;
        assert_eq!(recovered, 1);
        assert!(!dir.has_marker(Marker::Lock));
        assert!(dir.has_marker(Marker::Error));
        assert!(dir
            .load_metadata()
            .failure_reason
            .unwrap()
            .contains("no usable capture output"));
    }

    #[tokio::test]
    async fn live_window_is_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, merge, store) = setup(tmp.path());
        // Window still open for another hour
        let dir = locked_dir(tmp.path(), "bk_live", 3600);

        let recovered = recover_stale_recordings(&config, &merge, &store).await;
        assert_eq!(recovered, 0);
        assert!(dir.has_marker(Marker::Lock));
        assert!(!dir.has_marker(Marker::Error));
    }

    #[tokio::test]
    async fn corrupt_marker_combination_is_surfaced() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, merge, store) = setup(tmp.path());
        let start = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        let dir = RecordingDir::for_booking(tmp.path(), start, "bk_corrupt");
        dir.create().unwrap();
        dir.write_marker(Marker::Lock).unwrap();
        dir.write_marker(Marker::Done).unwrap();

        recover_stale_recordings(&config, &merge, &store).await;
        assert!(dir.has_marker(Marker::Error));
        assert!(dir
            .load_metadata()
            .failure_reason
            .unwrap()
            .contains("marker corruption"));
    }

    #[tokio::test]
    async fn completed_dirs_are_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, merge, store) = setup(tmp.path());
        let start = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        let dir = RecordingDir::for_booking(tmp.path(), start, "bk_done");
        dir.create().unwrap();
        dir.write_marker(Marker::Done).unwrap();
        dir.write_marker(Marker::Merged).unwrap();
        dir.write_marker(Marker::Completed).unwrap();

        let recovered = recover_stale_recordings(&config, &merge, &store).await;
        assert_eq!(recovered, 0);
        assert!(!dir.has_marker(Marker::Error));
    }
}
