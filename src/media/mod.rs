//! Shared media plumbing: ffprobe inspection and ffmpeg subprocess runs.
//!
//! Capture, merge and branding all shell out to ffmpeg; this module owns
//! the one way that is done (timeout, stderr capture, exit handling) so the
//! call sites stay about pipelines, not process management.

pub mod probe;

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

/// How many trailing bytes of encoder chatter to keep for error reports
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum FfmpegError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {code:?}: {stderr_tail}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr_tail: String,
    },
}

impl FfmpegError {
    /// Timeouts and spawn errors are worth retrying; a clean non-zero exit
    /// usually reproduces.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FfmpegError::Failed { .. })
    }
}

/// Run an ffmpeg-family command to completion under a timeout.
///
/// On timeout the child is killed; a process that was killed mid-write may
/// leave a partial output behind, which is why callers always write to a
/// temp path and rename.
pub async fn run_ffmpeg(
    program: &Path,
    args: &[OsString],
    timeout: Duration,
) -> Result<(), FfmpegError> {
    let program_name = program.display().to_string();
    debug!("Running {} {:?}", program_name, args);

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| FfmpegError::Spawn {
            program: program_name.clone(),
            source,
        })?;

    let mut stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => {
            return Err(FfmpegError::Spawn {
                program: program_name,
                source,
            })
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(FfmpegError::Timeout {
                program: program_name,
                timeout,
            });
        }
    };

    if status.success() {
        return Ok(());
    }

    let stderr_bytes = stderr_task.await.unwrap_or_default();
    Err(FfmpegError::Failed {
        program: program_name,
        code: status.code(),
        stderr_tail: stderr_tail(&stderr_bytes),
    })
}

fn stderr_tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

/// Convenience for building arg vectors out of mixed path/str pieces
pub fn args<I, S>(parts: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    parts.into_iter().map(Into::into).collect()
}
