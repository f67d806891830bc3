//! One ffmpeg encoder per camera device.
//!
//! The encoder writes fragmented MP4 so a killed process still leaves a
//! decodable file for the salvage path. Graceful stop is ffmpeg's `q`
//! keypress on stdin; a hard kill follows if the process ignores it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CaptureConfig;

/// How long an encoder may take to produce its first bytes before the
/// session start is declared failed.
const STEADY_STATE_TIMEOUT: Duration = Duration::from_secs(3);
const STEADY_STATE_POLL: Duration = Duration::from_millis(100);

pub(crate) struct Encoder {
    pub device: String,
    pub out_path: PathBuf,
    /// When the encoder was observed producing output, for skew measurement
    pub steady_at: Instant,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_task: JoinHandle<Vec<u8>>,
}

/// Terminal state of one encoder after `stop`
#[derive(Debug)]
pub(crate) struct EncoderStop {
    pub file_size: u64,
    /// The process exited on its own or on `q`, not via kill
    pub clean: bool,
}

fn encode_args(config: &CaptureConfig, device: &str, duration: Duration, out: &Path) -> Vec<OsString> {
    crate::media::args([
        OsString::from("-hide_banner"),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-f".into(),
        "v4l2".into(),
        "-framerate".into(),
        config.framerate.to_string().into(),
        "-video_size".into(),
        config.resolution.to_string().into(),
        "-i".into(),
        device.into(),
        "-t".into(),
        format!("{:.3}", duration.as_secs_f64()).into(),
        "-an".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "veryfast".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-b:v".into(),
        format!("{}k", config.bitrate_kbps).into(),
        "-movflags".into(),
        "+frag_keyframe+empty_moov".into(),
        out.as_os_str().to_os_string(),
    ])
}

impl Encoder {
    /// Spawn an encoder and wait until it reaches steady state (output file
    /// exists and is growing). Fails fast if the process dies first.
    pub(crate) async fn spawn(
        config: &CaptureConfig,
        device: &str,
        duration: Duration,
        out_path: PathBuf,
    ) -> Result<Encoder, String> {
        let args = encode_args(config, device, duration, &out_path);
        debug!("Starting encoder for {device}: ffmpeg {:?}", args);

        let mut child = Command::new(&config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("spawn failed: {e}"))?;

        let stdin = child.stdin.take();
        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        // Steady state: the output file has its first bytes on disk
        let deadline = Instant::now() + STEADY_STATE_TIMEOUT;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                let stderr_bytes = stderr_task.await.unwrap_or_default();
                let tail = String::from_utf8_lossy(&stderr_bytes);
                return Err(format!(
                    "encoder exited during startup ({status}): {}",
                    tail.trim()
                ));
            }

            let has_output = std::fs::metadata(&out_path)
                .map(|m| m.len() > 0)
                .unwrap_or(false);
            if has_output {
                return Ok(Encoder {
                    device: device.to_string(),
                    out_path,
                    steady_at: Instant::now(),
                    child,
                    stdin,
                    stderr_task,
                });
            }

            if Instant::now() >= deadline {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err("no output produced within startup window".into());
            }
            tokio::time::sleep(STEADY_STATE_POLL).await;
        }
    }

    /// Whether the encoder process has exited
    pub(crate) fn exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Whether the encoder exited with a failure status
    pub(crate) fn exited_with_error(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(status)) if !status.success())
    }

    /// Graceful stop: `q` on stdin, flush, then kill after `graceful`.
    /// Safe to call on an encoder that already finished its `-t` run.
    pub(crate) async fn stop(mut self, graceful: Duration) -> EncoderStop {
        let mut clean = true;

        let already_done = matches!(self.child.try_wait(), Ok(Some(_)));
        if !already_done {
            if let Some(mut stdin) = self.stdin.take() {
                let _ = stdin.write_all(b"q").await;
                let _ = stdin.flush().await;
                // Dropping stdin closes the pipe, a second stop signal for
                // ffmpeg builds that ignore the keypress.
            }

            match tokio::time::timeout(graceful, self.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(
                        "Encoder for {} ignored graceful stop, killing",
                        self.device
                    );
                    clean = false;
                    let _ = self.child.start_kill();
                    let _ = self.child.wait().await;
                }
            }
        }

        self.stderr_task.abort();

        let file_size = std::fs::metadata(&self.out_path).map(|m| m.len()).unwrap_or(0);
        EncoderStop { file_size, clean }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_args_carry_capture_parameters() {
        let config = CaptureConfig::default();
        let args = encode_args(
            &config,
            "/dev/video0",
            Duration::from_secs(60),
            Path::new("/tmp/cam0.mp4"),
        );
        let rendered: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let framerate_pos = rendered.iter().position(|a| a == "-framerate").unwrap();
        assert_eq!(rendered[framerate_pos + 1], config.framerate.to_string());

        let size_pos = rendered.iter().position(|a| a == "-video_size").unwrap();
        assert_eq!(rendered[size_pos + 1], config.resolution.to_string());

        let dur_pos = rendered.iter().position(|a| a == "-t").unwrap();
        assert_eq!(rendered[dur_pos + 1], "60.000");

        assert!(rendered.contains(&"-an".to_string()));
        assert!(rendered
            .iter()
            .any(|a| a.contains("frag_keyframe+empty_moov")));
        assert_eq!(rendered.last().unwrap(), "/tmp/cam0.mp4");
    }
}
