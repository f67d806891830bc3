//! Workspace layout, marker protocol and per-recording metadata.
//!
//! Every booking owns one directory, `<workspace>/<YYYY-MM-DD>/<booking_id>/`,
//! holding the per-camera raw files, the merged and final artifacts, a
//! `metadata.json` document, and the sentinel markers that carry pipeline
//! state across process boundaries and crashes.
//!
//! Marker table (presence is the signal, content is informational):
//!
//! | Marker         | Meaning                              | Written by     | Consumed by    |
//! |----------------|--------------------------------------|----------------|----------------|
//! | `.lock`        | Capture in progress                  | Supervisor     | Supervisor     |
//! | `.done`        | Raw capture complete, ready to merge | Supervisor     | Post-Processor |
//! | `.merged`      | Merge succeeded                      | Merge engine   | Post-Processor |
//! | `.merge_error` | Merge failed after all retries       | Merge engine   | Post-Processor |
//! | `.completed`   | Uploaded and booking store updated   | Post-Processor | Cleanup        |
//! | `.error`       | Terminal failure                     | Any            | Operator       |
//!
//! Invariants: `.lock` and `.done` are mutually exclusive, `.completed`
//! implies `.merged`, `.error` halts further processing for that booking.
//! All markers are created with `O_EXCL` semantics.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Sentinel files forming the on-disk state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Lock,
    Done,
    Merged,
    MergeError,
    Completed,
    Error,
}

impl Marker {
    pub const ALL: [Marker; 6] = [
        Marker::Lock,
        Marker::Done,
        Marker::Merged,
        Marker::MergeError,
        Marker::Completed,
        Marker::Error,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Marker::Lock => ".lock",
            Marker::Done => ".done",
            Marker::Merged => ".merged",
            Marker::MergeError => ".merge_error",
            Marker::Completed => ".completed",
            Marker::Error => ".error",
        }
    }
}

/// Names of the fixed artifacts inside a recording directory
pub const CAM_FILE_NAMES: [&str; 2] = ["cam0.mp4", "cam1.mp4"];
pub const MERGED_FILE_NAME: &str = "merged.mp4";
pub const FINAL_FILE_NAME: &str = "final.mp4";
pub const METADATA_FILE_NAME: &str = "metadata.json";

const WORK_LOCK_FILE_NAME: &str = ".pplock";
const WORK_LOCK_STALE_SECS: u64 = 3600;

/// Per-recording metadata document, read-modify-written as steps complete
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingMetadata {
    pub booking_id: Option<String>,
    pub user_id: Option<String>,
    /// Unique id of the capture session that produced this directory
    pub session_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    /// Measured encoder start skew between the two cameras
    pub start_skew_ms: Option<u64>,

    pub cameras: Vec<CameraFileInfo>,

    /// Camera 1 faulted mid-session and its file is shorter than camera 0's
    pub camera1_truncated: bool,

    /// Merge method that actually produced `merged.mp4`
    pub method: Option<String>,

    /// Why the configured method was not the one used
    pub fallback_reason: Option<String>,

    pub merged_duration_secs: Option<f64>,
    pub final_duration_secs: Option<f64>,
    pub final_size_bytes: Option<u64>,
    pub checksum_sha256: Option<String>,
    pub storage_url: Option<String>,

    /// Short human-readable reason when the booking ends in `failed`
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraFileInfo {
    pub file: String,
    pub size_bytes: u64,
    pub duration_secs: Option<f64>,
}

/// Handle to one booking's directory in the workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingDir {
    path: PathBuf,
}

impl RecordingDir {
    /// Directory for `booking_id` on the date of `start`, under `root`
    pub fn for_booking(root: &Path, start: DateTime<Utc>, booking_id: &str) -> Self {
        Self {
            path: root
                .join(start.format("%Y-%m-%d").to_string())
                .join(booking_id),
        }
    }

    pub fn from_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Booking id component of the directory path
    pub fn booking_id(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// Date component of the directory path
    pub fn date(&self) -> Option<NaiveDate> {
        self.path
            .parent()?
            .file_name()?
            .to_str()?
            .parse::<NaiveDate>()
            .ok()
    }

    pub fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.path)
    }

    pub fn cam_path(&self, index: usize) -> PathBuf {
        self.path.join(CAM_FILE_NAMES[index])
    }

    pub fn merged_path(&self) -> PathBuf {
        self.path.join(MERGED_FILE_NAME)
    }

    pub fn final_path(&self) -> PathBuf {
        self.path.join(FINAL_FILE_NAME)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(METADATA_FILE_NAME)
    }

    pub fn marker_path(&self, marker: Marker) -> PathBuf {
        self.path.join(marker.file_name())
    }

    pub fn has_marker(&self, marker: Marker) -> bool {
        self.marker_path(marker).exists()
    }

    /// Atomically create a zero-byte marker. Fails with `AlreadyExists` if
    /// another writer got there first.
    pub fn write_marker(&self, marker: Marker) -> io::Result<()> {
        let path = self.marker_path(marker);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.sync_all()?;
        debug!("Marker {} created in {:?}", marker.file_name(), self.path);
        Ok(())
    }

    /// Atomically create a marker carrying an informational JSON payload
    pub fn write_marker_json<T: Serialize>(&self, marker: Marker, payload: &T) -> io::Result<()> {
        let path = self.marker_path(marker);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let bytes = serde_json::to_vec_pretty(payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        debug!("Marker {} created in {:?}", marker.file_name(), self.path);
        Ok(())
    }

    /// Like `write_marker`, but a marker already present is not an error.
    /// Used on paths that may re-run after a crash.
    pub fn ensure_marker(&self, marker: Marker) -> io::Result<()> {
        match self.write_marker(marker) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            other => other,
        }
    }

    pub fn clear_marker(&self, marker: Marker) -> io::Result<()> {
        match std::fs::remove_file(self.marker_path(marker)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Detect impossible marker combinations. A corrupted directory is
    /// surfaced as `.error` by the caller and processing halts for that
    /// booking.
    pub fn marker_corruption(&self) -> Option<String> {
        let lock = self.has_marker(Marker::Lock);
        let done = self.has_marker(Marker::Done);
        let merged = self.has_marker(Marker::Merged);
        let merge_error = self.has_marker(Marker::MergeError);
        let completed = self.has_marker(Marker::Completed);

        if lock && done {
            return Some(".lock and .done are mutually exclusive".into());
        }
        if merged && !done {
            return Some(".merged present without .done".into());
        }
        if completed && !merged {
            return Some(".completed present without .merged".into());
        }
        if merged && merge_error {
            return Some(".merged and .merge_error both present".into());
        }
        None
    }

    /// Read `metadata.json`, or an empty document if absent or unreadable
    pub fn load_metadata(&self) -> RecordingMetadata {
        match std::fs::read(self.metadata_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Unreadable metadata in {:?}: {e}", self.path);
                RecordingMetadata::default()
            }),
            Err(_) => RecordingMetadata::default(),
        }
    }

    /// Read-modify-write `metadata.json` atomically (temp + rename)
    pub fn update_metadata<F>(&self, mutate: F) -> io::Result<RecordingMetadata>
    where
        F: FnOnce(&mut RecordingMetadata),
    {
        let mut metadata = self.load_metadata();
        mutate(&mut metadata);

        let tmp = self.path.join(format!("{METADATA_FILE_NAME}.tmp"));
        let bytes = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, self.metadata_path())?;
        Ok(metadata)
    }

    /// Acquire the in-directory post-processing lock with `O_EXCL`
    /// semantics so multiple worker processes never race on one recording.
    /// A lock left behind by a crashed worker is taken over once it is
    /// older than an hour.
    pub fn acquire_work_lock(&self) -> Option<WorkLock> {
        let path = self.path.join(WORK_LOCK_FILE_NAME);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Some(WorkLock { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let stale = std::fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| t.elapsed().ok())
                        .map(|age| age.as_secs() > WORK_LOCK_STALE_SECS)
                        .unwrap_or(false);
                    if !stale {
                        return None;
                    }
                    warn!("Taking over stale worker lock in {:?}", self.path);
                    let _ = std::fs::remove_file(&path);
                }
                Err(_) => return None,
            }
        }
        None
    }
}

/// RAII guard for the per-directory worker lock
pub struct WorkLock {
    path: PathBuf,
}

impl Drop for WorkLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Enumerate all recording directories under the workspace root.
///
/// Readers scan without locks and must tolerate racing writers, so every
/// filesystem error below the root is skipped rather than propagated.
pub fn scan_recording_dirs(root: &Path) -> Vec<RecordingDir> {
    let mut dirs = Vec::new();
    let Ok(dates) = std::fs::read_dir(root) else {
        return dirs;
    };

    for date_entry in dates.flatten() {
        let date_path = date_entry.path();
        if !date_path.is_dir() {
            continue;
        }
        let is_date = date_entry
            .file_name()
            .to_str()
            .map(|n| n.parse::<NaiveDate>().is_ok())
            .unwrap_or(false);
        if !is_date {
            continue;
        }

        let Ok(bookings) = std::fs::read_dir(&date_path) else {
            continue;
        };
        for booking_entry in bookings.flatten() {
            let path = booking_entry.path();
            if path.is_dir() {
                dirs.push(RecordingDir::from_path(path));
            }
        }
    }

    dirs.sort_by(|a, b| a.path().cmp(b.path()));
    dirs
}

/// Free bytes available under `path`, for the capture disk guard
#[cfg(unix)]
pub fn free_space_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn free_space_bytes(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dir() -> (tempfile::TempDir, RecordingDir) {
        let tmp = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2026, 8, 1, 14, 0, 0).unwrap();
        let rec = RecordingDir::for_booking(tmp.path(), start, "bk_42");
        rec.create().unwrap();
        (tmp, rec)
    }

    #[test]
    fn layout_is_date_slash_booking() {
        let (_tmp, rec) = dir();
        assert_eq!(rec.booking_id(), Some("bk_42"));
        assert_eq!(
            rec.date(),
            Some(NaiveDate::from_ymd_opt(2026, 8, 1).unwrap())
        );
        assert!(rec.path().ends_with("2026-08-01/bk_42"));
    }

    #[test]
    fn marker_create_is_exclusive() {
        let (_tmp, rec) = dir();
        rec.write_marker(Marker::Lock).unwrap();
        let err = rec.write_marker(Marker::Lock).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(rec.has_marker(Marker::Lock));

        rec.clear_marker(Marker::Lock).unwrap();
        assert!(!rec.has_marker(Marker::Lock));
        // clearing an absent marker is fine
        rec.clear_marker(Marker::Lock).unwrap();
    }

    #[test]
    fn ensure_marker_tolerates_existing() {
        let (_tmp, rec) = dir();
        rec.write_marker(Marker::Done).unwrap();
        rec.ensure_marker(Marker::Done).unwrap();
    }

    #[test]
    fn corruption_rules() {
        let (_tmp, rec) = dir();
        assert!(rec.marker_corruption().is_none());

        rec.write_marker(Marker::Lock).unwrap();
        rec.write_marker(Marker::Done).unwrap();
        assert!(rec.marker_corruption().unwrap().contains("mutually exclusive"));
        rec.clear_marker(Marker::Lock).unwrap();

        rec.write_marker(Marker::Merged).unwrap();
        assert!(rec.marker_corruption().is_none());

        rec.write_marker(Marker::Completed).unwrap();
        assert!(rec.marker_corruption().is_none());

        rec.clear_marker(Marker::Merged).unwrap();
        assert!(rec.marker_corruption().unwrap().contains(".completed"));
    }

    #[test]
    fn metadata_read_modify_write() {
        let (_tmp, rec) = dir();
        rec.update_metadata(|m| {
            m.booking_id = Some("bk_42".into());
            m.start_skew_ms = Some(37);
        })
        .unwrap();
        rec.update_metadata(|m| {
            m.method = Some("feather_blend".into());
        })
        .unwrap();

        let metadata = rec.load_metadata();
        assert_eq!(metadata.booking_id.as_deref(), Some("bk_42"));
        assert_eq!(metadata.start_skew_ms, Some(37));
        assert_eq!(metadata.method.as_deref(), Some("feather_blend"));
        assert!(!metadata.camera1_truncated);
    }

    #[test]
    fn work_lock_excludes_second_worker() {
        let (_tmp, rec) = dir();
        let lock = rec.acquire_work_lock().unwrap();
        assert!(rec.acquire_work_lock().is_none());
        drop(lock);
        assert!(rec.acquire_work_lock().is_some());
    }

    #[test]
    fn scan_skips_non_date_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2026, 8, 1, 14, 0, 0).unwrap();
        let a = RecordingDir::for_booking(tmp.path(), start, "bk_a");
        let b = RecordingDir::for_booking(tmp.path(), start, "bk_b");
        a.create().unwrap();
        b.create().unwrap();
        std::fs::create_dir_all(tmp.path().join("queue").join("junk")).unwrap();
        std::fs::create_dir_all(tmp.path().join("not-a-date").join("bk_c")).unwrap();

        let dirs = scan_recording_dirs(tmp.path());
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0].booking_id(), Some("bk_a"));
        assert_eq!(dirs[1].booking_id(), Some("bk_b"));
    }

    #[test]
    fn marker_json_payload_is_informational() {
        let (_tmp, rec) = dir();
        #[derive(Serialize)]
        struct Reason<'a> {
            reason: &'a str,
        }
        rec.write_marker_json(Marker::Error, &Reason { reason: "expired" })
            .unwrap();
        let raw = std::fs::read_to_string(rec.marker_path(Marker::Error)).unwrap();
        assert!(raw.contains("expired"));
    }
}
