//! Booking model and the local cache file the external API writes.
//!
//! Bookings are read-only to this process apart from status advances, which
//! are monotone: `scheduled < recording < completed < processing < uploaded`
//! with `failed` off-axis and terminal. The cache file is replaced
//! atomically as a whole by the API, so readers see either the previous
//! snapshot or the next one, never a partial write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, error, warn};

/// Lifecycle states, in advance order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Scheduled,
    Recording,
    Completed,
    Processing,
    Uploaded,
    Failed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Recording => "recording",
            BookingStatus::Completed => "completed",
            BookingStatus::Processing => "processing",
            BookingStatus::Uploaded => "uploaded",
            BookingStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> Option<u8> {
        match self {
            BookingStatus::Scheduled => Some(0),
            BookingStatus::Recording => Some(1),
            BookingStatus::Completed => Some(2),
            BookingStatus::Processing => Some(3),
            BookingStatus::Uploaded => Some(4),
            BookingStatus::Failed => None,
        }
    }

    /// Whether moving to `next` respects the monotone lifecycle.
    /// `failed` is reachable from any non-terminal state and terminal.
    pub fn can_advance_to(&self, next: BookingStatus) -> bool {
        match (self.rank(), next.rank()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(from), Some(to)) => to > from,
        }
    }
}

/// The unit of work: a scheduled time interval the appliance must record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,

    pub user_id: String,

    /// Camera/site identifier assigned by the booking API
    #[serde(default)]
    pub camera_id: Option<String>,

    pub start_time: DateTime<Utc>,

    pub end_time: DateTime<Utc>,

    #[serde(default)]
    pub status: Option<BookingStatus>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Booking {
    /// Whether the booking window `[start_time, end_time)` contains `now`
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now < self.end_time
    }

    /// Whether the window closed before it was ever started
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.end_time <= now
    }

    /// Remaining duration from `now`, truncated to the window
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.end_time - now.max(self.start_time)).max(chrono::Duration::zero())
    }

    /// Validity gate applied at load time
    fn well_formed(&self) -> bool {
        !self.id.is_empty() && self.end_time > self.start_time
    }
}

/// Reader for the booking cache file with a last-good snapshot.
///
/// A missing file means zero bookings. A file that fails to parse keeps the
/// previous snapshot in effect; after `alert_threshold` consecutive failures
/// the condition is escalated in the logs for the operator.
pub struct BookingCache {
    path: PathBuf,
    last_good: Vec<Booking>,
    consecutive_failures: u32,
    alert_threshold: u32,
}

impl BookingCache {
    pub fn new(path: PathBuf, alert_threshold: u32) -> Self {
        Self {
            path,
            last_good: Vec::new(),
            consecutive_failures: 0,
            alert_threshold,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Re-read the cache file and return the current snapshot.
    pub fn refresh(&mut self) -> &[Booking] {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => {
                // An empty file is a valid snapshot of zero bookings
                self.consecutive_failures = 0;
                self.last_good.clear();
            }
            Ok(bytes) => match serde_json::from_slice::<Vec<Booking>>(&bytes) {
                Ok(bookings) => {
                    self.consecutive_failures = 0;
                    let before = bookings.len();
                    self.last_good = bookings.into_iter().filter(Booking::well_formed).collect();
                    if self.last_good.len() < before {
                        warn!(
                            dropped = before - self.last_good.len(),
                            "Booking cache contained malformed records"
                        );
                    }
                }
                Err(e) => self.note_failure(&format!("parse error: {e}")),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // The API may not have written the file yet; treat as empty
                debug!("Booking cache {:?} missing, treating as empty", self.path);
                self.consecutive_failures = 0;
                self.last_good.clear();
            }
            Err(e) => self.note_failure(&format!("read error: {e}")),
        }

        &self.last_good
    }

    /// Current snapshot without touching the filesystem
    pub fn snapshot(&self) -> &[Booking] {
        &self.last_good
    }

    fn note_failure(&mut self, reason: &str) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.alert_threshold {
            error!(
                failures = self.consecutive_failures,
                "Booking cache unreadable ({reason}); still serving last-good snapshot"
            );
        } else {
            warn!(
                failures = self.consecutive_failures,
                "Booking cache unreadable ({reason}); keeping last-good snapshot"
            );
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

    #[test]
    fn status_advances_are_monotone() {
        use BookingStatus::*;
        assert!(Scheduled.can_advance_to(Recording));
        assert!(Recording.can_advance_to(Completed));
        assert!(Completed.can_advance_to(Processing));
        assert!(Processing.can_advance_to(Uploaded));
        assert!(!Uploaded.can_advance_to(Processing));
        assert!(!Completed.can_advance_to(Recording));
    }

    #[test]
    fn failed_is_terminal_but_reachable() {
        use BookingStatus::*;
        assert!(Scheduled.can_advance_to(Failed));
        assert!(Processing.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Scheduled));
        assert!(!Failed.can_advance_to(Uploaded));
    }

    #[test]
    fn window_containment() {
        let b = booking("b1", 100, 200);
        assert!(!b.contains(Utc.timestamp_opt(99, 0).unwrap()));
        assert!(b.contains(Utc.timestamp_opt(100, 0).unwrap()));
        assert!(b.contains(Utc.timestamp_opt(199, 0).unwrap()));
        assert!(!b.contains(Utc.timestamp_opt(200, 0).unwrap()));
        assert!(b.expired(Utc.timestamp_opt(200, 0).unwrap()));
    }

    #[test]
    fn missing_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = BookingCache::new(dir.path().join("bookings.json"), 3);
        assert!(cache.refresh().is_empty());
    }

    #[test]
    fn parse_failure_keeps_last_good() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookings.json");
        let mut cache = BookingCache::new(path.clone(), 3);

        let b = booking("b1", 100, 200);
        std::fs::write(&path, serde_json::to_vec(&vec![b]).unwrap()).unwrap();
        assert_eq!(cache.refresh().len(), 1);

        std::fs::write(&path, b"{not json").unwrap();
        assert_eq!(cache.refresh().len(), 1);
        assert_eq!(cache.snapshot()[0].id, "b1");
    }

    #[test]
    fn empty_file_clears_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookings.json");
        let mut cache = BookingCache::new(path.clone(), 3);

        std::fs::write(&path, serde_json::to_vec(&vec![booking("b1", 100, 200)]).unwrap())
            .unwrap();
        assert_eq!(cache.refresh().len(), 1);

        std::fs::write(&path, b"").unwrap();
        assert!(cache.refresh().is_empty());
    }

    #[test]
    fn malformed_records_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookings.json");
        let mut cache = BookingCache::new(path.clone(), 3);

        // end before start
        let mut bad = booking("bad", 300, 200);
        bad.end_time = Utc.timestamp_opt(200, 0).unwrap();
        let good = booking("good", 100, 200);
        std::fs::write(&path, serde_json::to_vec(&vec![bad, good]).unwrap()).unwrap();

        let snapshot = cache.refresh();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "good");
    }

    #[test]
    fn rfc3339_timestamps_parse() {
        let raw = r#"[{
            "id": "bk_1",
            "user_id": "u_9",
            "camera_id": "site-3",
            "start_time": "2026-08-01T14:00:00+02:00",
            "end_time": "2026-08-01T15:00:00+02:00",
            "status": "scheduled"
        }]"#;
        let bookings: Vec<Booking> = serde_json::from_str(raw).unwrap();
        assert_eq!(bookings[0].status, Some(BookingStatus::Scheduled));
        assert_eq!(
            (bookings[0].end_time - bookings[0].start_time).num_seconds(),
            3600
        );
    }
}
