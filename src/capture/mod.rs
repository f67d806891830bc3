//! Capture driver: exclusive owner of the two physical camera devices.
//!
//! Produces two time-aligned encoded files per booking and exposes health.
//! Lives inside the supervisor process because device ownership must be
//! co-located with the scheduler; nothing else opens the cameras.

mod driver;
mod encoder;

pub use driver::{CaptureDriver, SessionReport, SessionStart};

use thiserror::Error;

/// Per-device lifecycle. A released device reads as `Absent` until the next
/// probe re-acquires it; `Faulted` is a sink requiring external intervention
/// (device reset) before the slot is usable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Absent,
    Acquired,
    Recording,
    Faulted,
}

/// What a camera left behind when its session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraOutcome {
    /// A flushed, non-empty file
    File { size_bytes: u64 },
    /// The device never produced usable output
    Missing,
}

impl CameraOutcome {
    pub fn size_bytes(&self) -> u64 {
        match self {
            CameraOutcome::File { size_bytes } => *size_bytes,
            CameraOutcome::Missing => 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Another session already holds the devices
    #[error("a capture session is already active")]
    Busy,

    /// Pre-acquire probe failed; the device is missing or held elsewhere
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    /// An encoder did not reach steady state
    #[error("encoder for device {device} failed to start: {reason}")]
    StartFailed { device: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
