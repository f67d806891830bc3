//! Persisted deferred-retry queue.
//!
//! A transport failure during upload or the store update must survive a
//! process restart, so each pending retry is one JSON file under
//! `<workspace>/queue/`, keyed by booking id. Records drain oldest-first
//! once due; rescheduling overwrites the record in place (temp + rename).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::upload::UploadReceipt;

const QUEUE_DIR: &str = "queue";

/// Which step still needs to happen. The two retry separately so a
/// successful upload is never re-performed for a store hiccup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStage {
    Upload,
    DbUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub booking_id: String,
    pub user_id: String,
    /// Recording directory, for the `.completed` marker once done
    pub dir: PathBuf,
    pub final_path: PathBuf,
    pub key: String,
    pub stage: RetryStage,
    pub attempt: u32,
    pub next_time: DateTime<Utc>,
    /// Present once the upload succeeded; carries what the store insert
    /// needs
    #[serde(default)]
    pub receipt: Option<UploadReceipt>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

#[derive(Clone)]
pub struct RetryQueue {
    dir: PathBuf,
}

impl RetryQueue {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            dir: workspace_root.join(QUEUE_DIR),
        }
    }

    fn record_path(&self, booking_id: &str) -> PathBuf {
        self.dir.join(format!("{booking_id}.json"))
    }

    /// Persist (or reschedule) a retry record
    pub fn push(&self, record: &RetryRecord) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.record_path(&record.booking_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn remove(&self, booking_id: &str) -> io::Result<()> {
        match std::fs::remove_file(self.record_path(booking_id)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Whether a booking currently has a pending retry. The scan loop uses
    /// this to leave queued recordings to the drain path.
    pub fn contains(&self, booking_id: &str) -> bool {
        self.record_path(booking_id).exists()
    }

    /// All records, oldest `next_time` first
    pub fn all(&self) -> Vec<RetryRecord> {
        let mut records = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return records;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match std::fs::read(&path).and_then(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Unreadable retry record {:?}: {e}", path),
            }
        }
        records.sort_by(|a: &RetryRecord, b: &RetryRecord| {
            a.next_time
                .cmp(&b.next_time)
                .then(a.booking_id.cmp(&b.booking_id))
        });
        records
    }

    /// Records whose `next_time` has passed, oldest-first
    pub fn due(&self, now: DateTime<Utc>) -> Vec<RetryRecord> {
        self.all()
            .into_iter()
            .filter(|r| r.next_time <= now)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, offset_secs: i64) -> RetryRecord {
        RetryRecord {
            booking_id: id.to_string(),
            user_id: "u1".into(),
            dir: PathBuf::from("/ws/2026-08-01").join(id),
            final_path: PathBuf::from("/ws/2026-08-01").join(id).join("final.mp4"),
            key: format!("rec/u1/2026-08-01/{id}.mp4"),
            stage: RetryStage::Upload,
            attempt: 1,
            next_time: Utc::now() + Duration::seconds(offset_secs),
            receipt: None,
            duration_secs: Some(59.5),
        }
    }

    #[test]
    fn push_then_due_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = RetryQueue::new(tmp.path());

        queue.push(&record("bk_late", 3600)).unwrap();
        queue.push(&record("bk_due", -10)).unwrap();

        assert_eq!(queue.len(), 2);
        let due = queue.due(Utc::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].booking_id, "bk_due");
    }

    #[test]
    fn drain_order_is_oldest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = RetryQueue::new(tmp.path());

        queue.push(&record("bk_b", -10)).unwrap();
        queue.push(&record("bk_a", -300)).unwrap();
        queue.push(&record("bk_c", -60)).unwrap();

        let due = queue.due(Utc::now());
        let order: Vec<&str> = due.iter().map(|r| r.booking_id.as_str()).collect();
        assert_eq!(order, ["bk_a", "bk_c", "bk_b"]);
    }

    #[test]
    fn reschedule_overwrites_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = RetryQueue::new(tmp.path());

        queue.push(&record("bk_1", -10)).unwrap();
        let mut updated = record("bk_1", 600);
        updated.attempt = 4;
        queue.push(&updated).unwrap();

        assert_eq!(queue.len(), 1);
        assert!(queue.due(Utc::now()).is_empty());
        assert_eq!(queue.all()[0].attempt, 4);
    }

    #[test]
    fn remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = RetryQueue::new(tmp.path());

        queue.push(&record("bk_1", 0)).unwrap();
        assert!(queue.contains("bk_1"));
        queue.remove("bk_1").unwrap();
        assert!(!queue.contains("bk_1"));
        queue.remove("bk_1").unwrap();
    }

    #[test]
    fn stage_and_receipt_survive_serialization() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = RetryQueue::new(tmp.path());

        let mut r = record("bk_1", -5);
        r.stage = RetryStage::DbUpdate;
        r.receipt = Some(crate::upload::UploadReceipt {
            url: "https://store.example/b/k.mp4".into(),
            key: "k.mp4".into(),
            size_bytes: 123,
            checksum_sha256: "aa".repeat(32),
        });
        queue.push(&r).unwrap();

        let back = queue.all().remove(0);
        assert_eq!(back.stage, RetryStage::DbUpdate);
        assert_eq!(back.receipt.unwrap().size_bytes, 123);
    }
}
