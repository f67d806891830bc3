//! Per-recording post-processing pipeline: branding, upload, store update,
//! completion.
//!
//! Steps 1-3 (intro, logos, validation) fail the booking terminally; the
//! network steps defer into the retry queue instead, so a recording
//! produced during an outage ships as soon as connectivity returns.

use anyhow::Result;
use chrono::Utc;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::retry_queue::{RetryQueue, RetryRecord, RetryStage};
use crate::booking::BookingStatus;
use crate::config::{Config, Corner, LogoOverlay};
use crate::media::probe::{self, MediaInfo};
use crate::media::run_ffmpeg;
use crate::retry::{retry_async, RetryPolicy};
use crate::store::{BookingStoreClient, VideoRecord};
use crate::upload::{ObjectStoreClient, UploadReceipt};
use crate::workspace::{Marker, RecordingDir, CAM_FILE_NAMES};

const CONCAT_LIST_NAME: &str = "concat.txt";
const INTRO_MERGED_NAME: &str = "intro+merged.mp4";

pub struct Pipeline {
    config: Arc<Config>,
    store: BookingStoreClient,
    object_store: ObjectStoreClient,
    queue: RetryQueue,
    policy: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        store: BookingStoreClient,
        object_store: ObjectStoreClient,
        queue: RetryQueue,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config.retry);
        Self {
            config,
            store,
            object_store,
            queue,
            policy,
        }
    }

    /// Run the pipeline for one ready recording directory. The caller
    /// holds the per-directory work lock.
    pub async fn process(&self, dir: &RecordingDir) -> Result<()> {
        let metadata = dir.load_metadata();
        let booking_id = metadata
            .booking_id
            .clone()
            .or_else(|| dir.booking_id().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let user_id = metadata.user_id.clone().unwrap_or_else(|| "unknown".to_string());

        if dir.has_marker(Marker::MergeError) {
            let reason = metadata
                .failure_reason
                .clone()
                .unwrap_or_else(|| "merge failed".to_string());
            self.fail_terminal(dir, &booking_id, &reason).await;
            return Ok(());
        }

        info!(booking_id, "Post-processing {:?}", dir.path());
        self.advance_status(&booking_id, BookingStatus::Processing).await;

        let (final_path, final_info) = match self.brand(dir).await {
            Ok(result) => result,
            Err(reason) => {
                self.fail_terminal(dir, &booking_id, &reason).await;
                return Ok(());
            }
        };

        let date = dir
            .date()
            .map(|d| d.to_string())
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
        let key = self.object_store.object_key(&user_id, &date, &booking_id);

        let record = RetryRecord {
            booking_id: booking_id.clone(),
            user_id,
            dir: dir.path().to_path_buf(),
            final_path: final_path.clone(),
            key: key.clone(),
            stage: RetryStage::Upload,
            attempt: 0,
            next_time: Utc::now(),
            receipt: None,
            duration_secs: Some(final_info.duration_secs),
        };

        self.upload_and_complete(record).await
    }

    /// Shared by the first attempt and queue drains: upload, then the
    /// store writes, deferring whichever stage fails.
    pub async fn upload_and_complete(&self, mut record: RetryRecord) -> Result<()> {
        if record.stage == RetryStage::Upload {
            let upload = retry_async(self.policy, "upload", || {
                let key = record.key.clone();
                let path = record.final_path.clone();
                async move { self.object_store.put_file(&key, &path).await }
            })
            .await;

            match upload {
                Ok(receipt) => {
                    record.receipt = Some(receipt);
                    record.stage = RetryStage::DbUpdate;
                }
                Err(e) => {
                    warn!(
                        booking_id = %record.booking_id,
                        attempt = record.attempt,
                        "Upload deferred: {e}"
                    );
                    self.defer(record);
                    return Ok(());
                }
            }
        }

        // DB update is retried separately so a verified upload is never
        // re-performed.
        let Some(receipt) = record.receipt.clone() else {
            anyhow::bail!("retry record in DbUpdate stage without a receipt");
        };

        let db_result = retry_async(self.policy, "store update", || {
            let receipt = receipt.clone();
            let record = record.clone();
            async move {
                let video = VideoRecord {
                    booking_id: record.booking_id.clone(),
                    user_id: record.user_id.clone(),
                    url: receipt.url.clone(),
                    size_bytes: receipt.size_bytes,
                    duration_secs: record.duration_secs,
                    checksum_sha256: receipt.checksum_sha256.clone(),
                };
                self.store.insert_video_metadata(&video).await?;
                self.store
                    .update_booking_status(&record.booking_id, BookingStatus::Uploaded)
                    .await
            }
        })
        .await;

        if let Err(e) = db_result {
            warn!(
                booking_id = %record.booking_id,
                "Store update deferred: {e}"
            );
            self.defer(record);
            return Ok(());
        }

        self.finalize(&record, &receipt);
        Ok(())
    }

    /// Push a record back on the queue with backoff + jitter. Retries are
    /// indefinite; only the per-attempt budget is capped.
    fn defer(&self, mut record: RetryRecord) {
        let delay = self.policy.backoff_with_jitter(record.attempt);
        record.attempt = record.attempt.saturating_add(1);
        record.next_time =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        if let Err(e) = self.queue.push(&record) {
            warn!(
                booking_id = %record.booking_id,
                "Failed to persist retry record: {e}"
            );
        }
    }

    /// Completion: metadata, `.completed`, local cleanup
    fn finalize(&self, record: &RetryRecord, receipt: &UploadReceipt) {
        let dir = RecordingDir::from_path(record.dir.clone());
        let _ = self.queue.remove(&record.booking_id);

        let _ = dir.update_metadata(|m| {
            m.storage_url = Some(receipt.url.clone());
            m.checksum_sha256 = Some(receipt.checksum_sha256.clone());
            m.final_size_bytes = Some(receipt.size_bytes);
            m.final_duration_secs = record.duration_secs;
        });

        if let Err(e) = dir.ensure_marker(Marker::Completed) {
            warn!(booking_id = %record.booking_id, "Cannot publish .completed: {e}");
            return;
        }

        info!(booking_id = %record.booking_id, url = %receipt.url, "Recording completed");

        if self.config.postprocess.cleanup_after_upload {
            self.cleanup(&dir);
        }
    }

    /// Remove intermediates; the final artifact and metadata stay unless
    /// configured otherwise.
    fn cleanup(&self, dir: &RecordingDir) {
        let mut targets: Vec<PathBuf> = CAM_FILE_NAMES
            .iter()
            .map(|name| dir.path().join(name))
            .collect();
        targets.push(dir.merged_path());
        targets.push(dir.path().join(CONCAT_LIST_NAME));
        targets.push(dir.path().join(INTRO_MERGED_NAME));
        if self.config.postprocess.remove_final {
            targets.push(dir.final_path());
        }

        for target in targets {
            if target.exists() {
                if let Err(e) = std::fs::remove_file(&target) {
                    warn!("Cleanup failed for {:?}: {e}", target);
                } else {
                    debug!("Cleaned up {:?}", target);
                }
            }
        }
    }

    /// Steps 1-3: optional intro concatenation, logo overlays, and final
    /// validation. Produces `final.mp4` atomically.
    async fn brand(&self, dir: &RecordingDir) -> Result<(PathBuf, MediaInfo), String> {
        let pp = &self.config.postprocess;
        let merged = dir.merged_path();
        let merged_info = probe::probe(&pp.ffprobe_path, &merged)
            .await
            .map_err(|e| format!("merged artifact unusable: {e}"))?;

        let mut expected = merged_info.duration_secs;
        let mut stage_input = merged;

        if let Some(intro) = pp.intro_path.as_deref() {
            if intro.exists() {
                let out = dir.path().join(INTRO_MERGED_NAME);
                let intro_duration = self
                    .concat_intro(dir, intro, &stage_input, &merged_info, &out)
                    .await?;
                expected += intro_duration;
                stage_input = out;
            } else {
                debug!("Intro asset {:?} absent, skipping concatenation", intro);
            }
        }

        let final_path = dir.final_path();
        let tmp = final_path.with_extension("mp4.tmp");

        let overlays = self.resolve_overlays()?;
        if overlays.is_empty() {
            // Nothing to burn in: remux the staged input into the final
            let args = crate::media::args([
                OsString::from("-hide_banner"),
                "-loglevel".into(),
                "error".into(),
                "-y".into(),
                "-i".into(),
                stage_input.as_os_str().to_os_string(),
                "-c".into(),
                "copy".into(),
                tmp.as_os_str().to_os_string(),
            ]);
            run_ffmpeg(&pp.ffmpeg_path, &args, step_timeout(expected))
                .await
                .map_err(|e| format!("final remux failed: {e}"))?;
        } else {
            let (graph, out_label) = overlay_graph(&overlays);
            let mut args: Vec<OsString> = vec![
                "-hide_banner".into(),
                "-loglevel".into(),
                "error".into(),
                "-y".into(),
                "-i".into(),
                stage_input.as_os_str().to_os_string(),
            ];
            for logo in &overlays {
                args.push("-i".into());
                args.push(logo.path.as_os_str().to_os_string());
            }
            args.extend::<Vec<OsString>>(vec![
                "-filter_complex".into(),
                graph.into(),
                "-map".into(),
                format!("[{out_label}]").into(),
                "-an".into(),
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "veryfast".into(),
                tmp.as_os_str().to_os_string(),
            ]);
            run_ffmpeg(&pp.ffmpeg_path, &args, step_timeout(expected))
                .await
                .map_err(|e| format!("logo overlay failed: {e}"))?;
        }

        // Final validation, same rules as the merge contract
        let info = probe::probe(&pp.ffprobe_path, &tmp)
            .await
            .map_err(|e| format!("final validation probe failed: {e}"))?;
        if let Err(reason) = probe::meets_output_contract(&info, expected) {
            let _ = std::fs::remove_file(&tmp);
            return Err(format!("final validation failed: {reason}"));
        }

        std::fs::rename(&tmp, &final_path)
            .map_err(|e| format!("final rename failed: {e}"))?;
        Ok((final_path, info))
    }

    /// Concat-demuxer join of intro and merged footage. Inputs must share
    /// codec and resolution; a mismatched intro is re-encoded once and the
    /// normalized copy cached beside the asset.
    async fn concat_intro(
        &self,
        dir: &RecordingDir,
        intro: &Path,
        merged: &Path,
        merged_info: &MediaInfo,
        out: &Path,
    ) -> Result<f64, String> {
        let pp = &self.config.postprocess;
        let intro_info = probe::probe(&pp.ffprobe_path, intro)
            .await
            .map_err(|e| format!("intro asset unusable: {e}"))?;

        let matches = intro_info.codec == merged_info.codec
            && intro_info.width == merged_info.width
            && intro_info.height == merged_info.height;

        let intro_to_use = if matches {
            intro.to_path_buf()
        } else {
            self.normalized_intro(intro, merged_info).await?
        };
        let intro_duration = probe::probe(&pp.ffprobe_path, &intro_to_use)
            .await
            .map(|i| i.duration_secs)
            .unwrap_or(intro_info.duration_secs);

        let list_path = dir.path().join(CONCAT_LIST_NAME);
        let list = format!(
            "file '{}'\nfile '{}'\n",
            escape_concat_path(&intro_to_use),
            escape_concat_path(merged),
        );
        std::fs::write(&list_path, list).map_err(|e| format!("concat list write failed: {e}"))?;

        let args = crate::media::args([
            OsString::from("-hide_banner"),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.as_os_str().to_os_string(),
            "-c".into(),
            "copy".into(),
            out.as_os_str().to_os_string(),
        ]);
        run_ffmpeg(
            &pp.ffmpeg_path,
            &args,
            step_timeout(merged_info.duration_secs + intro_duration),
        )
        .await
        .map_err(|e| format!("intro concatenation failed: {e}"))?;

        Ok(intro_duration)
    }

    /// Re-encode the intro to the merged footage's codec and resolution,
    /// cached next to the asset keyed by target geometry.
    async fn normalized_intro(
        &self,
        intro: &Path,
        target: &MediaInfo,
    ) -> Result<PathBuf, String> {
        let pp = &self.config.postprocess;
        let stem = intro
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("intro");
        let cached = intro.with_file_name(format!(
            "{stem}_normalized_{}x{}.mp4",
            target.width, target.height
        ));

        if cached.exists() {
            if let Ok(info) = probe::probe(&pp.ffprobe_path, &cached).await {
                if info.width == target.width && info.height == target.height {
                    debug!("Using cached normalized intro {:?}", cached);
                    return Ok(cached);
                }
            }
        }

        info!("Re-encoding intro {:?} to {}x{}", intro, target.width, target.height);
        let args = crate::media::args([
            OsString::from("-hide_banner"),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-i".into(),
            intro.as_os_str().to_os_string(),
            "-vf".into(),
            format!(
                "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
                w = target.width,
                h = target.height
            )
            .into(),
            "-an".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            cached.as_os_str().to_os_string(),
        ]);
        run_ffmpeg(&pp.ffmpeg_path, &args, Duration::from_secs(300))
            .await
            .map_err(|e| format!("intro re-encode failed: {e}"))?;
        Ok(cached)
    }

    /// Overlays present on disk, in config order. A missing optional logo
    /// is skipped silently; a missing required logo is a hard error.
    fn resolve_overlays(&self) -> Result<Vec<LogoOverlay>, String> {
        let mut resolved = Vec::new();
        for logo in &self.config.postprocess.logos {
            if logo.path.exists() {
                resolved.push(logo.clone());
            } else if logo.required {
                return Err(format!("required logo missing: {:?}", logo.path));
            } else {
                debug!("Optional logo {:?} absent, skipping", logo.path);
            }
        }
        Ok(resolved)
    }

    pub(crate) async fn fail_terminal(&self, dir: &RecordingDir, booking_id: &str, reason: &str) {
        warn!(booking_id, reason, "Post-processing failed terminally");
        let _ = dir.update_metadata(|m| {
            if m.failure_reason.is_none() {
                m.failure_reason = Some(reason.to_string());
            }
        });
        let payload = serde_json::json!({ "reason": reason });
        if let Err(e) = dir.write_marker_json(Marker::Error, &payload) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                warn!(booking_id, "Cannot publish .error: {e}");
            }
        }
        if let Err(e) = self.store.mark_booking_failed(booking_id, reason).await {
            warn!(booking_id, "Store update failed: {e}");
        }
    }

    async fn advance_status(&self, booking_id: &str, status: BookingStatus) {
        if let Err(e) = self.store.update_booking_status(booking_id, status).await {
            warn!(booking_id, status = status.as_str(), "Status update failed: {e}");
        }
    }
}

/// Single filter chain applying every overlay, scaled to its configured
/// size and pinned to its corner with a fixed margin.
fn overlay_graph(logos: &[LogoOverlay]) -> (String, String) {
    const MARGIN: u32 = 16;
    let mut parts = Vec::new();
    let mut current = "0:v".to_string();

    for (i, logo) in logos.iter().enumerate() {
        let scaled = format!("l{i}");
        let next = format!("v{i}");
        parts.push(format!(
            "[{input}:v]scale={w}:{h}[{scaled}]",
            input = i + 1,
            w = logo.width,
            h = logo.height,
        ));
        let position = match logo.corner {
            Corner::Tl => format!("{MARGIN}:{MARGIN}"),
            Corner::Tr => format!("main_w-overlay_w-{MARGIN}:{MARGIN}"),
            Corner::Bl => format!("{MARGIN}:main_h-overlay_h-{MARGIN}"),
            Corner::Br => {
                format!("main_w-overlay_w-{MARGIN}:main_h-overlay_h-{MARGIN}")
            }
        };
        parts.push(format!("[{current}][{scaled}]overlay={position}[{next}]"));
        current = next;
    }

    (parts.join(";"), current)
}

/// Concat-demuxer lists quote with single quotes; embedded quotes use the
/// close-escape-reopen dance.
fn escape_concat_path(path: &Path) -> String {
    path.display().to_string().replace('\'', "'\\''")
}

fn step_timeout(expected_duration_secs: f64) -> Duration {
    Duration::from_secs_f64((2.0 * expected_duration_secs).max(60.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logo(corner: Corner, required: bool) -> LogoOverlay {
        LogoOverlay {
            path: PathBuf::from("/opt/brand/logo.png"),
            corner,
            width: 160,
            height: 90,
            required,
        }
    }

    #[test]
    fn overlay_graph_chains_in_order() {
        let logos = vec![logo(Corner::Tl, true), logo(Corner::Br, false)];
        let (graph, out) = overlay_graph(&logos);
        assert_eq!(out, "v1");
        assert!(graph.contains("[1:v]scale=160:90[l0]"));
        assert!(graph.contains("[0:v][l0]overlay=16:16[v0]"));
        assert!(graph.contains(
            "[v0][l1]overlay=main_w-overlay_w-16:main_h-overlay_h-16[v1]"
        ));
    }

    #[test]
    fn overlay_positions_cover_all_corners() {
        for (corner, needle) in [
            (Corner::Tl, "overlay=16:16"),
            (Corner::Tr, "overlay=main_w-overlay_w-16:16"),
            (Corner::Bl, "overlay=16:main_h-overlay_h-16"),
            (Corner::Br, "overlay=main_w-overlay_w-16:main_h-overlay_h-16"),
        ] {
            let (graph, _) = overlay_graph(&[logo(corner, false)]);
            assert!(graph.contains(needle), "missing {needle} in {graph}");
        }
    }

    #[test]
    fn concat_path_escaping_handles_quotes() {
        assert_eq!(
            escape_concat_path(Path::new("/media/o'brien/intro.mp4")),
            "/media/o'\\''brien/intro.mp4"
        );
    }

    #[test]
    fn step_timeout_has_a_floor() {
        assert_eq!(step_timeout(5.0), Duration::from_secs(60));
        assert_eq!(step_timeout(90.0), Duration::from_secs(180));
    }
}
