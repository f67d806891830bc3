//! ffprobe wrapper used for input checks and post-step validation.

use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("file {0:?} does not exist")]
    Missing(std::path::PathBuf),

    #[error("file {0:?} is empty")]
    Empty(std::path::PathBuf),

    #[error("i/o failure while probing: {0}")]
    Io(#[from] std::io::Error),

    #[error("ffprobe rejected {path:?}: {stderr}")]
    Undecodable {
        path: std::path::PathBuf,
        stderr: String,
    },

    #[error("unexpected ffprobe output for {path:?}: {reason}")]
    Malformed {
        path: std::path::PathBuf,
        reason: String,
    },
}

/// What validation needs to know about a media file
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    pub size_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Probe the first video stream of `path`.
///
/// A successful probe doubles as the "decodable header" check: ffprobe
/// refuses files it cannot open.
pub async fn probe(ffprobe: &Path, path: &Path) -> Result<MediaInfo, ProbeError> {
    if !path.exists() {
        return Err(ProbeError::Missing(path.to_path_buf()));
    }
    let size_bytes = std::fs::metadata(path)?.len();
    if size_bytes == 0 {
        return Err(ProbeError::Empty(path.to_path_buf()));
    }

    let output = Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(path.as_os_str())
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(ProbeError::Undecodable {
            path: path.to_path_buf(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let parsed: ProbeOutput =
        serde_json::from_slice(&output.stdout).map_err(|e| ProbeError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let stream = parsed
        .streams
        .first()
        .ok_or_else(|| ProbeError::Malformed {
            path: path.to_path_buf(),
            reason: "no video stream".into(),
        })?;

    // Stream duration is absent in some containers; fall back to format
    let duration_secs = stream
        .duration
        .as_deref()
        .or(parsed.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(MediaInfo {
        duration_secs,
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        codec: stream.codec_name.clone().unwrap_or_default(),
        size_bytes,
    })
}

/// The validation rule applied after merge and branding steps: duration at
/// least 90% of expected, both dimensions positive, non-zero size.
pub fn meets_output_contract(info: &MediaInfo, expected_duration_secs: f64) -> Result<(), String> {
    if info.size_bytes == 0 {
        return Err("output is empty".into());
    }
    if info.width == 0 || info.height == 0 {
        return Err(format!(
            "output has degenerate dimensions {}x{}",
            info.width, info.height
        ));
    }
    if expected_duration_secs > 0.0 && info.duration_secs < 0.9 * expected_duration_secs {
        return Err(format!(
            "output duration {:.2}s below 90% of expected {:.2}s",
            info.duration_secs, expected_duration_secs
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(duration: f64, width: u32, height: u32, size: u64) -> MediaInfo {
        MediaInfo {
            duration_secs: duration,
            width,
            height,
            codec: "h264".into(),
            size_bytes: size,
        }
    }

    #[test]
    fn contract_accepts_slightly_short_output() {
        assert!(meets_output_contract(&info(54.5, 3840, 1080, 1 << 20), 60.0).is_ok());
    }

    #[test]
    fn contract_rejects_truncated_output() {
        let err = meets_output_contract(&info(10.0, 3840, 1080, 1 << 20), 60.0).unwrap_err();
        assert!(err.contains("below 90%"));
    }

    #[test]
    fn contract_rejects_degenerate_dimensions() {
        assert!(meets_output_contract(&info(60.0, 0, 1080, 1 << 20), 60.0).is_err());
        assert!(meets_output_contract(&info(60.0, 3840, 1080, 0), 60.0).is_err());
    }

    #[test]
    fn contract_without_expectation_checks_shape_only() {
        assert!(meets_output_contract(&info(0.0, 1920, 1080, 1024), 0.0).is_ok());
    }

    #[test]
    fn probe_json_parses_stream_and_format() {
        let raw = r#"{
            "streams": [{"codec_name": "h264", "width": 1920, "height": 1080}],
            "format": {"duration": "59.96"}
        }"#;
        let parsed: ProbeOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.streams[0].width, Some(1920));
        assert_eq!(parsed.format.unwrap().duration.as_deref(), Some("59.96"));
    }

    #[tokio::test]
    async fn probe_missing_file_fails_fast() {
        let err = probe(Path::new("ffprobe"), Path::new("/nonexistent/clip.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Missing(_)));
    }
}
