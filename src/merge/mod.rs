//! Merge engine: two synchronized per-camera clips in, one panoramic clip
//! out.
//!
//! A pure file-to-file transformer built on ffmpeg filtergraphs. The output
//! is replaced atomically (write to temp, rename), audio is discarded, and
//! the output duration is the shorter input's. Each method retries with
//! backoff before the engine walks the fallback chain down to a minimal
//! hstack; the method that actually produced the artifact is recorded.

pub mod calibration;
mod filters;

use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Config, MergeMethod};
use crate::media::probe::{self, MediaInfo};
use crate::media::{run_ffmpeg, FfmpegError};
use crate::retry::RetryPolicy;
use crate::workspace::{Marker, RecordingDir};
use calibration::{Calibration, CalibrationError};
use filters::MergeGeometry;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge input {path:?} unusable: {reason}")]
    Input { path: std::path::PathBuf, reason: String },

    #[error("all merge methods failed; last error: {last_error}")]
    Exhausted { last_error: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What the engine actually did, for `metadata.json`
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub method: MergeMethod,
    pub fallback_reason: Option<String>,
    pub info: MediaInfo,
}

/// One step of the fallback chain
struct PlannedAttempt {
    method: MergeMethod,
    /// Why the chain moved here from the configured method
    reason: Option<String>,
    graph: String,
}

pub struct MergeEngine {
    config: std::sync::Arc<Config>,
    policy: RetryPolicy,
}

impl MergeEngine {
    pub fn new(config: std::sync::Arc<Config>) -> Self {
        let policy = RetryPolicy::from_config(&config.retry);
        Self { config, policy }
    }

    /// Merge `left` and `right` into `out` with the requested method,
    /// falling back per the chain when it cannot be honored.
    pub async fn merge(
        &self,
        left: &Path,
        right: &Path,
        out: &Path,
        method: MergeMethod,
    ) -> Result<MergeOutcome, MergeError> {
        let ffprobe = &self.config.merge.ffprobe_path;
        let left_info = probe::probe(ffprobe, left).await.map_err(|e| MergeError::Input {
            path: left.to_path_buf(),
            reason: e.to_string(),
        })?;
        let right_info = probe::probe(ffprobe, right).await.map_err(|e| MergeError::Input {
            path: right.to_path_buf(),
            reason: e.to_string(),
        })?;

        let expected = left_info.duration_secs.min(right_info.duration_secs);
        let geometry = MergeGeometry::from_dimensions(
            (left_info.width, left_info.height),
            (right_info.width, right_info.height),
        );

        let chain = self.plan_chain(method, geometry);
        let timeout = attempt_timeout(expected);
        let mut last_error = String::from("empty merge plan");

        for attempt in chain {
            match self
                .run_attempt(left, right, out, &attempt, expected, timeout)
                .await
            {
                Ok(info) => {
                    info!(
                        method = attempt.method.as_str(),
                        fallback = attempt.reason.as_deref().unwrap_or("none"),
                        duration_secs = info.duration_secs,
                        "Merge produced {:?}",
                        out
                    );
                    return Ok(MergeOutcome {
                        method: attempt.method,
                        fallback_reason: attempt.reason,
                        info,
                    });
                }
                Err(e) => {
                    warn!(
                        method = attempt.method.as_str(),
                        "Merge method failed after retries: {e}"
                    );
                    last_error = e;
                }
            }
        }

        Err(MergeError::Exhausted { last_error })
    }

    /// Merge a recording directory's camera files and publish the result
    /// markers. Invoked synchronously by the supervisor after capture, and
    /// by crash recovery for orphaned directories. Handles the one-camera
    /// salvage case with a passthrough re-encode.
    pub async fn merge_recording(&self, dir: &RecordingDir) -> Result<MergeOutcome, MergeError> {
        let left = dir.cam_path(0);
        let right = dir.cam_path(1);
        let out = dir.merged_path();
        let min_bytes = self.config.capture.min_bytes;

        let usable = |p: &Path| {
            std::fs::metadata(p)
                .map(|m| m.len() >= min_bytes)
                .unwrap_or(false)
        };

        let result = match (usable(&left), usable(&right)) {
            (true, true) => self.merge(&left, &right, &out, self.config.merge.method).await,
            (true, false) => self.single_camera(&left, &out, "camera1_unusable").await,
            (false, true) => self.single_camera(&right, &out, "camera0_unusable").await,
            (false, false) => Err(MergeError::Input {
                path: left,
                reason: "no camera file meets the minimum size".into(),
            }),
        };

        match &result {
            Ok(outcome) => {
                let truncated = self.camera1_truncated(dir).await;
                let outcome_method = outcome.method.as_str().to_string();
                let fallback = outcome.fallback_reason.clone();
                let duration = outcome.info.duration_secs;
                dir.update_metadata(move |m| {
                    m.method = Some(outcome_method);
                    m.fallback_reason = fallback;
                    m.merged_duration_secs = Some(duration);
                    m.camera1_truncated = truncated;
                })?;
                dir.ensure_marker(Marker::Merged)?;
            }
            Err(e) => {
                let reason = e.to_string();
                dir.update_metadata(|m| {
                    m.failure_reason = Some(reason);
                })?;
                let payload = serde_json::json!({ "reason": e.to_string() });
                if let Err(marker_err) = dir.write_marker_json(Marker::MergeError, &payload) {
                    if marker_err.kind() != std::io::ErrorKind::AlreadyExists {
                        return Err(MergeError::Io(marker_err));
                    }
                }
            }
        }

        result
    }

    /// One usable camera: re-encode it alone so the pipeline still ships
    /// something watchable.
    async fn single_camera(
        &self,
        input: &Path,
        out: &Path,
        reason: &str,
    ) -> Result<MergeOutcome, MergeError> {
        let ffprobe = &self.config.merge.ffprobe_path;
        let info = probe::probe(ffprobe, input).await.map_err(|e| MergeError::Input {
            path: input.to_path_buf(),
            reason: e.to_string(),
        })?;
        let expected = info.duration_secs;
        let tmp = temp_path(out);

        let attempt = || {
            let tmp = tmp.clone();
            async move {
                let args = crate::media::args([
                    std::ffi::OsString::from("-hide_banner"),
                    "-loglevel".into(),
                    "error".into(),
                    "-y".into(),
                    "-i".into(),
                    input.as_os_str().to_os_string(),
                    "-an".into(),
                    "-c:v".into(),
                    "libx264".into(),
                    "-preset".into(),
                    "veryfast".into(),
                    tmp.as_os_str().to_os_string(),
                ]);
                run_ffmpeg(&self.config.merge.ffmpeg_path, &args, attempt_timeout(expected))
                    .await
                    .map_err(|e| e.to_string())?;
                self.validate_output(&tmp, expected).await
            }
        };

        let info = crate::retry::retry_async(self.policy, "single-camera merge", attempt)
            .await
            .map_err(|last_error| MergeError::Exhausted { last_error })?;

        std::fs::rename(&tmp, out)?;
        Ok(MergeOutcome {
            method: MergeMethod::SideBySide,
            fallback_reason: Some(reason.to_string()),
            info,
        })
    }

    /// Build the ordered fallback chain for a requested method.
    fn plan_chain(&self, requested: MergeMethod, geometry: MergeGeometry) -> Vec<PlannedAttempt> {
        let merge = &self.config.merge;
        let overlap_ok = filters::overlap_fits(merge.overlap_pixels, geometry);
        let mut chain = Vec::new();

        match requested {
            MergeMethod::Stitch => match self.load_calibration(geometry) {
                Ok(cal) => {
                    chain.push(PlannedAttempt {
                        method: MergeMethod::Stitch,
                        reason: None,
                        graph: filters::stitch(&cal, merge.overlap_pixels, geometry),
                    });
                    if overlap_ok {
                        chain.push(PlannedAttempt {
                            method: MergeMethod::FeatherBlend,
                            reason: Some("stitch_failed".into()),
                            graph: filters::feather_blend(
                                merge.rotate_degrees,
                                merge.overlap_pixels,
                                geometry,
                            ),
                        });
                    }
                }
                Err(reason) => {
                    if overlap_ok {
                        chain.push(PlannedAttempt {
                            method: MergeMethod::FeatherBlend,
                            reason: Some(reason),
                            graph: filters::feather_blend(
                                merge.rotate_degrees,
                                merge.overlap_pixels,
                                geometry,
                            ),
                        });
                    } else {
                        chain.push(PlannedAttempt {
                            method: MergeMethod::SideBySide,
                            reason: Some(reason),
                            graph: filters::side_by_side(merge.rotate_degrees, geometry),
                        });
                    }
                }
            },
            MergeMethod::FeatherBlend => {
                if overlap_ok {
                    chain.push(PlannedAttempt {
                        method: MergeMethod::FeatherBlend,
                        reason: None,
                        graph: filters::feather_blend(
                            merge.rotate_degrees,
                            merge.overlap_pixels,
                            geometry,
                        ),
                    });
                } else {
                    chain.push(PlannedAttempt {
                        method: MergeMethod::SideBySide,
                        reason: Some("overlap_invalid".into()),
                        graph: filters::side_by_side(merge.rotate_degrees, geometry),
                    });
                }
            }
            MergeMethod::SideBySide => {
                chain.push(PlannedAttempt {
                    method: MergeMethod::SideBySide,
                    reason: None,
                    graph: filters::side_by_side(merge.rotate_degrees, geometry),
                });
            }
        }

        // Last resort for every plan: the minimal hstack path
        let final_reason = chain
            .last()
            .map(|a| format!("{}_failed", a.method.as_str()))
            .unwrap_or_else(|| "no_viable_method".into());
        chain.push(PlannedAttempt {
            method: MergeMethod::SideBySide,
            reason: Some(final_reason),
            graph: filters::minimal_hstack(geometry),
        });

        chain
    }

    fn load_calibration(&self, geometry: MergeGeometry) -> Result<Calibration, String> {
        let Some(path) = self.config.merge.calibration_path.as_deref() else {
            return Err("calibration_missing".into());
        };
        let cal = match Calibration::load(path) {
            Ok(cal) => cal,
            Err(CalibrationError::Missing(_)) => return Err("calibration_missing".into()),
            Err(e) => {
                warn!("Calibration unusable: {e}");
                return Err("calibration_invalid".into());
            }
        };
        if let Err(reason) = cal.validate(geometry.right_width, geometry.height) {
            warn!("Calibration rejected: {reason}");
            return Err("calibration_invalid".into());
        }
        Ok(cal)
    }

    /// Run one planned method with the per-step retry budget. Returns the
    /// validated output info; the temp file is renamed into place only
    /// after validation passes.
    async fn run_attempt(
        &self,
        left: &Path,
        right: &Path,
        out: &Path,
        attempt: &PlannedAttempt,
        expected: f64,
        timeout: Duration,
    ) -> Result<MediaInfo, String> {
        let tmp = temp_path(out);

        let one_try = || {
            let tmp = tmp.clone();
            async move {
                let args = crate::media::args([
                    std::ffi::OsString::from("-hide_banner"),
                    "-loglevel".into(),
                    "error".into(),
                    "-y".into(),
                    "-i".into(),
                    left.as_os_str().to_os_string(),
                    "-i".into(),
                    right.as_os_str().to_os_string(),
                    "-filter_complex".into(),
                    attempt.graph.clone().into(),
                    "-map".into(),
                    "[v]".into(),
                    "-an".into(),
                    "-c:v".into(),
                    "libx264".into(),
                    "-preset".into(),
                    "veryfast".into(),
                    "-t".into(),
                    format!("{expected:.3}").into(),
                    tmp.as_os_str().to_os_string(),
                ]);

                run_ffmpeg(&self.config.merge.ffmpeg_path, &args, timeout)
                    .await
                    .map_err(|e: FfmpegError| e.to_string())?;
                self.validate_output(&tmp, expected).await
            }
        };

        let label = format!("merge:{}", attempt.method.as_str());
        let info = crate::retry::retry_async(self.policy, &label, one_try).await?;

        std::fs::rename(&tmp, out).map_err(|e| format!("rename into place failed: {e}"))?;
        Ok(info)
    }

    /// Re-probe the produced file and hold it to the output contract.
    /// Failed validation invalidates the output.
    async fn validate_output(&self, path: &Path, expected: f64) -> Result<MediaInfo, String> {
        let info = probe::probe(&self.config.merge.ffprobe_path, path)
            .await
            .map_err(|e| format!("validation probe failed: {e}"))?;
        if let Err(reason) = probe::meets_output_contract(&info, expected) {
            let _ = std::fs::remove_file(path);
            return Err(format!("validation failed: {reason}"));
        }
        Ok(info)
    }

    /// Camera 1 footage materially shorter than camera 0's marks the
    /// truncation flag consumers surface to the user.
    async fn camera1_truncated(&self, dir: &RecordingDir) -> bool {
        let ffprobe = &self.config.merge.ffprobe_path;
        let left = probe::probe(ffprobe, &dir.cam_path(0)).await.ok();
        let right = probe::probe(ffprobe, &dir.cam_path(1)).await.ok();
        match (left, right) {
            (Some(l), Some(r)) => r.duration_secs < 0.9 * l.duration_secs,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Per-attempt ceiling proportional to the footage being merged
fn attempt_timeout(expected_duration_secs: f64) -> Duration {
    Duration::from_secs_f64((2.0 * expected_duration_secs).max(60.0))
}

fn temp_path(out: &Path) -> std::path::PathBuf {
    let mut name = out.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    out.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn engine_with(mutate: impl FnOnce(&mut Config)) -> MergeEngine {
        let mut config = Config::default();
        mutate(&mut config);
        MergeEngine::new(Arc::new(config))
    }

    fn geometry() -> MergeGeometry {
        MergeGeometry::from_dimensions((1920, 1080), (1920, 1080))
    }

    #[test]
    fn timeout_scales_with_duration() {
        assert_eq!(attempt_timeout(10.0), Duration::from_secs(60));
        assert_eq!(attempt_timeout(120.0), Duration::from_secs(240));
    }

    #[test]
    fn temp_path_stays_in_directory() {
        let tmp = temp_path(Path::new("/data/2026-08-01/bk_1/merged.mp4"));
        assert_eq!(tmp, Path::new("/data/2026-08-01/bk_1/merged.mp4.tmp"));
    }

    #[test]
    fn stitch_without_calibration_falls_back_with_reason() {
        let engine = engine_with(|c| {
            c.merge.method = MergeMethod::Stitch;
            c.merge.calibration_path = None;
        });
        let chain = engine.plan_chain(MergeMethod::Stitch, geometry());
        assert_eq!(chain[0].method, MergeMethod::FeatherBlend);
        assert_eq!(chain[0].reason.as_deref(), Some("calibration_missing"));
        // Minimal hstack is always the last resort
        assert_eq!(chain.last().unwrap().method, MergeMethod::SideBySide);
    }

    #[test]
    fn stitch_with_valid_calibration_leads_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let cal_path = dir.path().join("calibration.json");
        std::fs::write(
            &cal_path,
            r#"{"homography": [[1,0,1650],[0,1,0],[0,0,1]]}"#,
        )
        .unwrap();

        let engine = engine_with(|c| {
            c.merge.method = MergeMethod::Stitch;
            c.merge.calibration_path = Some(cal_path);
        });
        let chain = engine.plan_chain(MergeMethod::Stitch, geometry());
        assert_eq!(chain[0].method, MergeMethod::Stitch);
        assert!(chain[0].reason.is_none());
        assert_eq!(chain[1].method, MergeMethod::FeatherBlend);
        assert_eq!(chain[1].reason.as_deref(), Some("stitch_failed"));
    }

    #[test]
    fn invalid_calibration_reports_invalid_not_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cal_path = dir.path().join("calibration.json");
        // Determinant far outside [0.5, 2.0]
        std::fs::write(
            &cal_path,
            r#"{"homography": [[10,0,0],[0,10,0],[0,0,1]]}"#,
        )
        .unwrap();

        let engine = engine_with(|c| {
            c.merge.method = MergeMethod::Stitch;
            c.merge.calibration_path = Some(cal_path);
        });
        let chain = engine.plan_chain(MergeMethod::Stitch, geometry());
        assert_eq!(chain[0].reason.as_deref(), Some("calibration_invalid"));
    }

    #[test]
    fn feather_with_oversized_overlap_degrades() {
        let engine = engine_with(|c| {
            c.merge.overlap_pixels = 4000;
        });
        let chain = engine.plan_chain(MergeMethod::FeatherBlend, geometry());
        assert_eq!(chain[0].method, MergeMethod::SideBySide);
        assert_eq!(chain[0].reason.as_deref(), Some("overlap_invalid"));
    }

    #[test]
    fn side_by_side_chain_ends_in_minimal_hstack() {
        let engine = engine_with(|_| {});
        let chain = engine.plan_chain(MergeMethod::SideBySide, geometry());
        assert_eq!(chain.len(), 2);
        assert!(chain[0].reason.is_none());
        assert_eq!(
            chain[1].reason.as_deref(),
            Some("side_by_side_failed")
        );
    }

    #[tokio::test]
    async fn merge_rejects_unusable_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(|_| {});
        let left = dir.path().join("cam0.mp4");
        let right = dir.path().join("cam1.mp4");
        std::fs::write(&left, b"").unwrap();

        let err = engine
            .merge(&left, &right, &dir.path().join("merged.mp4"), MergeMethod::SideBySide)
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Input { .. }));
    }
}
