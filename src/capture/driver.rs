//! Capture session lifecycle and device contention policy.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::encoder::Encoder;
use super::{CameraOutcome, CaptureError, DeviceState};
use crate::config::Config;
use crate::retry::RetryPolicy;

const DEVICE_LOCK_DIR: &str = ".devices";

/// Returned by `start_session` once both encoders are in steady state
#[derive(Debug, Clone, Copy)]
pub struct SessionStart {
    /// Measured start skew between the two encoders
    pub skew_ms: u64,
}

/// Returned by `stop_session` after both encoders have wound down
#[derive(Debug)]
pub struct SessionReport {
    pub booking_id: String,
    pub skew_ms: u64,
    pub outcomes: [CameraOutcome; 2],
}

impl SessionReport {
    /// Cameras whose file cleared the given salvage floor
    pub fn usable_count(&self, min_bytes: u64) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.size_bytes() >= min_bytes)
            .count()
    }
}

struct ActiveSession {
    booking_id: String,
    skew_ms: u64,
    encoders: [Option<Encoder>; 2],
    _device_locks: Vec<DeviceLock>,
}

/// Owns the two camera devices. Exactly one session may hold them at a
/// time; a second `start_session` fails with `Busy` without touching the
/// hardware.
pub struct CaptureDriver {
    config: std::sync::Arc<Config>,
    states: [DeviceState; 2],
    session: Option<ActiveSession>,
}

impl CaptureDriver {
    pub fn new(config: std::sync::Arc<Config>) -> Self {
        Self {
            config,
            states: [DeviceState::Absent, DeviceState::Absent],
            session: None,
        }
    }

    /// Reserve both devices, configure encoders, and begin writing to
    /// `out_paths`. Returns once both encoders report steady state, or
    /// fails fast releasing everything acquired so far.
    pub async fn start_session(
        &mut self,
        booking_id: &str,
        duration: Duration,
        out_paths: [PathBuf; 2],
    ) -> Result<SessionStart, CaptureError> {
        if self.session.is_some() {
            return Err(CaptureError::Busy);
        }

        // Probe and reserve both devices before any encoder starts
        let mut locks = Vec::new();
        for i in 0..2 {
            let device = self.config.capture.camera_ids[i].clone();
            match self.acquire_device(&device) {
                Ok(lock) => {
                    locks.push(lock);
                    self.states[i] = DeviceState::Acquired;
                }
                Err(e) => {
                    drop(locks);
                    self.release_all();
                    return Err(e);
                }
            }
        }

        // Start both encoders in parallel; transient spawn failures retry
        // with backoff, permanent ones fail the session start.
        let policy = RetryPolicy::from_config(&self.config.retry);
        let config = self.config.clone();
        let capture = &config.capture;
        let [out0, out1] = out_paths;

        let (left, right) = tokio::join!(
            spawn_with_retry(policy, capture, &capture.camera_ids[0], duration, out0),
            spawn_with_retry(policy, capture, &capture.camera_ids[1], duration, out1),
        );

        let (enc0, enc1) = match (left, right) {
            (Ok(a), Ok(b)) => (a, b),
            (a, b) => {
                let mut device = String::new();
                let mut reason = String::new();
                let mut survivors = Vec::new();
                for (i, result) in [a, b].into_iter().enumerate() {
                    match result {
                        Ok(enc) => survivors.push(enc),
                        Err(e) if device.is_empty() => {
                            device = capture.camera_ids[i].clone();
                            reason = e;
                        }
                        Err(_) => {}
                    }
                }
                // Wind down whichever side did start
                for enc in survivors {
                    enc.stop(Duration::from_millis(capture.stop_timeout_ms)).await;
                }
                drop(locks);
                self.release_all();
                return Err(CaptureError::StartFailed { device, reason });
            }
        };

        let skew = if enc0.steady_at > enc1.steady_at {
            enc0.steady_at - enc1.steady_at
        } else {
            enc1.steady_at - enc0.steady_at
        };
        let skew_ms = skew.as_millis() as u64;
        if skew_ms > capture.start_skew_limit_ms {
            warn!(
                skew_ms,
                limit_ms = capture.start_skew_limit_ms,
                "Encoder start skew exceeds configured bound"
            );
        }

        self.states = [DeviceState::Recording, DeviceState::Recording];
        self.session = Some(ActiveSession {
            booking_id: booking_id.to_string(),
            skew_ms,
            encoders: [Some(enc0), Some(enc1)],
            _device_locks: locks,
        });

        info!(booking_id, skew_ms, "Capture session started on both devices");
        Ok(SessionStart { skew_ms })
    }

    /// Per-device status, refreshed from the encoder processes. An encoder
    /// that died mid-session marks its device `Faulted`; one that ran its
    /// full `-t` duration parks back at `Acquired`.
    pub fn health(&mut self) -> [DeviceState; 2] {
        if let Some(session) = self.session.as_mut() {
            for (i, slot) in session.encoders.iter_mut().enumerate() {
                if let Some(encoder) = slot {
                    if self.states[i] == DeviceState::Recording && encoder.exited() {
                        if encoder.exited_with_error() {
                            warn!(
                                device = %encoder.device,
                                "Encoder faulted mid-session"
                            );
                            self.states[i] = DeviceState::Faulted;
                        } else {
                            self.states[i] = DeviceState::Acquired;
                        }
                    }
                }
            }
        }
        self.states
    }

    /// Both devices faulted: nothing left recording, the session cannot
    /// produce more footage.
    pub fn session_unrecoverable(&mut self) -> bool {
        self.session.is_some() && self.health().iter().all(|s| *s == DeviceState::Faulted)
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Graceful stop of both encoders, flush, release devices. Idempotent:
    /// returns `None` when no session is active.
    pub async fn stop_session(&mut self) -> Option<SessionReport> {
        let mut session = self.session.take()?;
        let graceful = Duration::from_millis(self.config.capture.stop_timeout_ms);

        let mut outcomes = [CameraOutcome::Missing, CameraOutcome::Missing];
        for (i, slot) in session.encoders.iter_mut().enumerate() {
            if let Some(encoder) = slot.take() {
                let faulted = self.states[i] == DeviceState::Faulted;
                let stop = encoder.stop(graceful).await;
                outcomes[i] = if stop.file_size > 0 {
                    CameraOutcome::File {
                        size_bytes: stop.file_size,
                    }
                } else {
                    CameraOutcome::Missing
                };
                if !faulted {
                    self.states[i] = DeviceState::Acquired;
                }
            }
        }

        self.release_all();

        info!(
            booking_id = %session.booking_id,
            cam0_bytes = outcomes[0].size_bytes(),
            cam1_bytes = outcomes[1].size_bytes(),
            "Capture session stopped"
        );

        Some(SessionReport {
            booking_id: session.booking_id,
            skew_ms: session.skew_ms,
            outcomes,
        })
    }

    fn release_all(&mut self) {
        for state in &mut self.states {
            if *state != DeviceState::Faulted {
                *state = DeviceState::Absent;
            }
        }
    }

    /// Probe a device and take its host-wide lock. Stale locks left by a
    /// dead process are broken; a live holder means `DeviceUnavailable`.
    fn acquire_device(&self, device: &str) -> Result<DeviceLock, CaptureError> {
        let device_path = Path::new(device);
        if device.starts_with("/dev") && !device_path.exists() {
            return Err(CaptureError::DeviceUnavailable {
                device: device.to_string(),
                reason: "device node missing".to_string(),
            });
        }

        let lock_dir = self.config.workspace_root.join(DEVICE_LOCK_DIR);
        std::fs::create_dir_all(&lock_dir)?;
        let lock_path = lock_dir.join(sanitize_selector(device));

        DeviceLock::acquire(lock_path).map_err(|reason| CaptureError::DeviceUnavailable {
            device: device.to_string(),
            reason,
        })
    }
}

/// Host-wide exclusivity for one device selector, held for the lifetime of
/// a session. The lock file records the holder's pid so a crashed holder
/// can be detected instead of blocking forever.
struct DeviceLock {
    path: PathBuf,
}

impl DeviceLock {
    fn acquire(path: PathBuf) -> Result<DeviceLock, String> {
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(DeviceLock { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if holder_alive(&path) {
                        return Err("held by a live process".to_string());
                    }
                    warn!("Breaking stale device lock {:?}", path);
                    let _ = std::fs::remove_file(&path);
                }
                Err(e) => return Err(format!("lock create failed: {e}")),
            }
        }
        Err("lock contention persisted".to_string())
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn holder_alive(lock_path: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(lock_path) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        return false;
    };
    #[cfg(target_os = "linux")]
    {
        Path::new("/proc").join(pid.to_string()).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        // Without a portable liveness probe, assume the holder is alive
        true
    }
}

fn sanitize_selector(device: &str) -> String {
    let cleaned: String = device
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{cleaned}.lock")
}

async fn spawn_with_retry(
    policy: RetryPolicy,
    capture: &crate::config::CaptureConfig,
    device: &str,
    duration: Duration,
    out_path: PathBuf,
) -> Result<Encoder, String> {
    crate::retry::retry_async(policy, "encoder start", || {
        Encoder::spawn(capture, device, duration, out_path.clone())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn driver_with_root(root: &Path) -> CaptureDriver {
        let mut config = Config::default();
        config.workspace_root = root.to_path_buf();
        // Selectors that skip the /dev existence probe in tests
        config.capture.camera_ids = ["test-cam-left".into(), "test-cam-right".into()];
        CaptureDriver::new(Arc::new(config))
    }

    #[test]
    fn device_lock_is_exclusive_against_live_holder() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cam.lock");

        let lock = DeviceLock::acquire(path.clone()).unwrap();
        // Same pid is alive, so a second acquire must refuse
        assert!(DeviceLock::acquire(path.clone()).is_err());
        drop(lock);
        assert!(DeviceLock::acquire(path).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stale_device_lock_is_broken() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cam.lock");
        // A pid that cannot exist on Linux
        std::fs::write(&path, "4194999999").unwrap();

        assert!(DeviceLock::acquire(path).is_ok());
    }

    #[test]
    fn selector_sanitization_is_filesystem_safe() {
        assert_eq!(
            sanitize_selector("/dev/v4l/by-id/usb-cam0"),
            "_dev_v4l_by_id_usb_cam0.lock"
        );
    }

    #[tokio::test]
    async fn stop_without_session_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut driver = driver_with_root(tmp.path());
        assert!(driver.stop_session().await.is_none());
        assert!(!driver.has_session());
        assert_eq!(
            driver.health(),
            [DeviceState::Absent, DeviceState::Absent]
        );
    }

    #[test]
    fn usable_count_applies_min_bytes_floor() {
        let report = SessionReport {
            booking_id: "b1".into(),
            skew_ms: 12,
            outcomes: [
                CameraOutcome::File {
                    size_bytes: 50 << 20,
                },
                CameraOutcome::File { size_bytes: 512 },
            ],
        };
        assert_eq!(report.usable_count(1024 * 1024), 1);
        assert_eq!(report.usable_count(256), 2);
        assert_eq!(report.usable_count(100 << 20), 0);
    }
}
