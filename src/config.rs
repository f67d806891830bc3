//! Configuration for the duorec appliance.
//!
//! Loaded once at process start: defaults, overlaid by an optional TOML
//! file, overlaid by environment variables, then validated and frozen
//! behind an `Arc`. A validation failure is a configuration error and the
//! process exits with code 1 before touching any device.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value in environment variable {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Capture device configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Merge engine configuration
    #[serde(default)]
    pub merge: MergeConfig,

    /// Supervisor scheduling configuration
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Post-processing and branding configuration
    #[serde(default)]
    pub postprocess: PostProcessConfig,

    /// Retry policy shared by merge and upload steps
    #[serde(default)]
    pub retry: RetryConfig,

    /// Object storage destination for final artifacts
    #[serde(default)]
    pub object_store: ObjectStoreConfig,

    /// Remote booking/metadata store
    #[serde(default)]
    pub booking_store: BookingStoreConfig,

    /// Filesystem base for all recording artifacts
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Interpretation of naive times, if any show up (discouraged)
    #[serde(default)]
    pub timezone_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Ordered pair of device selectors (left, right). Stable paths such as
    /// /dev/v4l/by-id/... survive reboots; plain indices do not.
    #[serde(default = "default_camera_ids")]
    pub camera_ids: [String; 2],

    /// Capture width x height per camera
    #[serde(default = "default_resolution")]
    pub resolution: Resolution,

    /// Capture FPS (fixed; variable FPS is not permitted)
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// Per-camera encoder bitrate in kbit/s
    #[serde(default = "default_bitrate")]
    pub bitrate_kbps: u32,

    /// Smallest per-camera file considered salvageable after a fault
    #[serde(default = "default_min_bytes")]
    pub min_bytes: u64,

    /// Seconds past end_time before a capture session is killed
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// Per-encoder budget for a graceful stop, in milliseconds
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Maximum tolerated start skew between the two encoders, in milliseconds
    #[serde(default = "default_start_skew_limit_ms")]
    pub start_skew_limit_ms: u64,

    /// ffmpeg binary used for encoding
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// How the two per-camera clips are combined
    #[serde(default)]
    pub method: MergeMethod,

    /// Optional pre-merge rotation applied to each frame
    #[serde(default)]
    pub rotate_degrees: i32,

    /// Feather blend overlap width in pixels
    #[serde(default = "default_overlap_pixels")]
    pub overlap_pixels: u32,

    /// Homography calibration document; absence disables the stitch path
    #[serde(default)]
    pub calibration_path: Option<PathBuf>,

    /// ffmpeg binary used for merging
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// ffprobe binary used for validation
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Tick period in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Path of the booking cache file written by the external API
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    /// Consecutive cache read failures before an alert is logged
    #[serde(default = "default_cache_alert_threshold")]
    pub cache_alert_threshold: u32,

    /// Bound on graceful shutdown drain, in seconds
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Free-space floor under the workspace; captures are refused below it
    #[serde(default = "default_disk_floor_bytes")]
    pub disk_floor_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostProcessConfig {
    /// Parallel post-processing workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Seconds between workspace scans
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Intro clip prepended to every recording, when present on disk
    #[serde(default)]
    pub intro_path: Option<PathBuf>,

    /// Logo overlays applied in one filter chain; at most one per corner
    #[serde(default)]
    pub logos: Vec<LogoOverlay>,

    /// Remove intermediate artifacts once a recording is completed
    #[serde(default = "default_true")]
    pub cleanup_after_upload: bool,

    /// Also remove the final artifact after a verified upload
    #[serde(default)]
    pub remove_final: bool,

    /// ffmpeg binary used for branding
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// ffprobe binary used for validation
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
}

/// One logo overlay in the branding pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoOverlay {
    pub path: PathBuf,

    pub corner: Corner,

    /// Rendered size in output pixels
    pub width: u32,
    pub height: u32,

    /// A required logo whose absence is a hard error (the main brand mark).
    /// Optional logos missing from disk are skipped silently.
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Corner {
    Tl,
    Tr,
    Bl,
    Br,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Per-step attempt cap
    #[serde(default = "default_retry_max")]
    pub max: u32,

    /// Base backoff in seconds; doubles per attempt
    #[serde(default = "default_retry_backoff")]
    pub backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Gateway endpoint holding the real storage credentials
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub bucket: String,

    /// Key prefix under the bucket
    #[serde(default)]
    pub prefix: String,

    /// Static bearer token presented to the gateway
    #[serde(default)]
    pub token: String,

    /// Files at or above this size upload in parts
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,

    /// Per-attempt upload timeout in seconds
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookingStoreConfig {
    /// Base URL of the booking/metadata REST API
    #[serde(default)]
    pub url: String,

    /// API key sent with every request
    #[serde(default)]
    pub key: String,
}

/// Capture dimensions, written as "WIDTHxHEIGHT" in config and environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| format!("invalid width in {s:?}"))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| format!("invalid height in {s:?}"))?;
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Resolution> for String {
    fn from(r: Resolution) -> Self {
        r.to_string()
    }
}

/// Merge strategy for the two per-camera clips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    #[default]
    SideBySide,
    FeatherBlend,
    Stitch,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMethod::SideBySide => "side_by_side",
            MergeMethod::FeatherBlend => "feather_blend",
            MergeMethod::Stitch => "stitch",
        }
    }
}

impl FromStr for MergeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "side_by_side" => Ok(MergeMethod::SideBySide),
            "feather_blend" => Ok(MergeMethod::FeatherBlend),
            "stitch" => Ok(MergeMethod::Stitch),
            other => Err(format!(
                "unknown merge method {other:?} (expected side_by_side, feather_blend or stitch)"
            )),
        }
    }
}

// Default value functions
fn default_camera_ids() -> [String; 2] {
    ["/dev/video0".to_string(), "/dev/video1".to_string()]
}

fn default_resolution() -> Resolution {
    Resolution {
        width: 1920,
        height: 1080,
    }
}

fn default_framerate() -> u32 {
    30
}

fn default_bitrate() -> u32 {
    6000
}

fn default_min_bytes() -> u64 {
    1024 * 1024
}

fn default_grace_secs() -> u64 {
    5
}

fn default_stop_timeout_ms() -> u64 {
    500
}

fn default_start_skew_limit_ms() -> u64 {
    100
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_overlap_pixels() -> u32 {
    100
}

fn default_poll_interval() -> u64 {
    5
}

fn default_cache_alert_threshold() -> u32 {
    5
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_disk_floor_bytes() -> u64 {
    // Two cameras at default bitrate fill roughly 90 MB per minute;
    // refuse to start below half an hour of headroom.
    3 * 1024 * 1024 * 1024
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

fn default_scan_interval_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_retry_max() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    2
}

fn default_multipart_threshold() -> u64 {
    64 * 1024 * 1024
}

fn default_upload_timeout_secs() -> u64 {
    600
}

fn default_workspace_root() -> PathBuf {
    directories::ProjectDirs::from("dev", "duorec", "duorec")
        .map(|dirs| dirs.data_dir().join("recordings"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/duorec/recordings"))
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_ids: default_camera_ids(),
            resolution: default_resolution(),
            framerate: default_framerate(),
            bitrate_kbps: default_bitrate(),
            min_bytes: default_min_bytes(),
            grace_secs: default_grace_secs(),
            stop_timeout_ms: default_stop_timeout_ms(),
            start_skew_limit_ms: default_start_skew_limit_ms(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            method: MergeMethod::default(),
            rotate_degrees: 0,
            overlap_pixels: default_overlap_pixels(),
            calibration_path: None,
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            cache_path: None,
            cache_alert_threshold: default_cache_alert_threshold(),
            drain_timeout_secs: default_drain_timeout_secs(),
            disk_floor_bytes: default_disk_floor_bytes(),
        }
    }
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            scan_interval_secs: default_scan_interval_secs(),
            intro_path: None,
            logos: Vec::new(),
            cleanup_after_upload: true,
            remove_final: false,
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max: default_retry_max(),
            backoff_secs: default_retry_backoff(),
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            prefix: String::new(),
            token: String::new(),
            multipart_threshold_bytes: default_multipart_threshold(),
            upload_timeout_secs: default_upload_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            merge: MergeConfig::default(),
            supervisor: SupervisorConfig::default(),
            postprocess: PostProcessConfig::default(),
            retry: RetryConfig::default(),
            object_store: ObjectStoreConfig::default(),
            booking_store: BookingStoreConfig::default(),
            workspace_root: default_workspace_root(),
            timezone_name: None,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the TOML file if given, then
    /// environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Config::default(),
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the booking cache file the external API writes
    pub fn cache_path(&self) -> PathBuf {
        self.supervisor
            .cache_path
            .clone()
            .unwrap_or_else(|| self.workspace_root.join("bookings.json"))
    }

    /// Overlay the environment variables enumerated in the deployment docs
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        override_string("CAMERA_0_ID", &mut self.capture.camera_ids[0]);
        override_string("CAMERA_1_ID", &mut self.capture.camera_ids[1]);
        override_parsed("RESOLUTION", &mut self.capture.resolution)?;
        override_parsed("FRAMERATE", &mut self.capture.framerate)?;
        override_parsed("BITRATE", &mut self.capture.bitrate_kbps)?;
        override_parsed("MERGE_METHOD", &mut self.merge.method)?;
        override_parsed("ROTATE_DEGREES", &mut self.merge.rotate_degrees)?;
        override_parsed("OVERLAP_PIXELS", &mut self.merge.overlap_pixels)?;
        override_path("WORKSPACE_ROOT", &mut self.workspace_root);
        override_parsed("POLL_INTERVAL_SECS", &mut self.supervisor.poll_interval_secs)?;
        override_parsed("RETRY_MAX", &mut self.retry.max)?;
        override_parsed("RETRY_BACKOFF_SECS", &mut self.retry.backoff_secs)?;
        override_string("OBJECT_STORE_BUCKET", &mut self.object_store.bucket);
        override_string("OBJECT_STORE_PREFIX", &mut self.object_store.prefix);
        override_string("OBJECT_STORE_CREDS_ENDPOINT", &mut self.object_store.endpoint);
        override_string("OBJECT_STORE_CREDS_TOKEN", &mut self.object_store.token);
        override_string("BOOKING_STORE_URL", &mut self.booking_store.url);
        override_string("BOOKING_STORE_KEY", &mut self.booking_store.key);

        if let Ok(tz) = std::env::var("TIMEZONE_NAME") {
            if !tz.is_empty() {
                self.timezone_name = Some(tz);
            }
        }

        Ok(())
    }

    /// Fail-fast sanity checks; anything wrong here exits the process
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.camera_ids[0] == self.capture.camera_ids[1] {
            return Err(ConfigError::Invalid(format!(
                "camera_ids must name two distinct devices, both are {:?}",
                self.capture.camera_ids[0]
            )));
        }
        if self.capture.resolution.width == 0 || self.capture.resolution.height == 0 {
            return Err(ConfigError::Invalid(
                "resolution must be non-zero in both dimensions".into(),
            ));
        }
        if self.capture.framerate == 0 {
            return Err(ConfigError::Invalid("framerate must be non-zero".into()));
        }
        if self.capture.bitrate_kbps == 0 {
            return Err(ConfigError::Invalid("bitrate must be non-zero".into()));
        }
        if self.merge.overlap_pixels >= self.capture.resolution.width {
            return Err(ConfigError::Invalid(format!(
                "overlap_pixels ({}) must be narrower than a camera frame ({})",
                self.merge.overlap_pixels, self.capture.resolution.width
            )));
        }
        if self.supervisor.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be non-zero".into(),
            ));
        }
        if self.postprocess.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }

        let mut seen = Vec::new();
        for logo in &self.postprocess.logos {
            if logo.width == 0 || logo.height == 0 {
                return Err(ConfigError::Invalid(format!(
                    "logo {:?} has a zero dimension",
                    logo.path
                )));
            }
            if seen.contains(&logo.corner) {
                return Err(ConfigError::Invalid(format!(
                    "more than one logo configured for corner {:?}",
                    logo.corner
                )));
            }
            seen.push(logo.corner);
        }

        Ok(())
    }
}

fn override_string(var: &str, slot: &mut String) {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *slot = value;
        }
    }
}

fn override_path(var: &str, slot: &mut PathBuf) {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *slot = PathBuf::from(value);
        }
    }
}

fn override_parsed<T>(var: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *slot = value.parse().map_err(|e: T::Err| ConfigError::Env {
                var: var.to_string(),
                reason: e.to_string(),
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_round_trips_through_strings() {
        let r: Resolution = "1920x1080".parse().unwrap();
        assert_eq!(r.width, 1920);
        assert_eq!(r.height, 1080);
        assert_eq!(r.to_string(), "1920x1080");
        assert!("1080p".parse::<Resolution>().is_err());
    }

    #[test]
    fn merge_method_names_match_metadata_values() {
        for (name, method) in [
            ("side_by_side", MergeMethod::SideBySide),
            ("feather_blend", MergeMethod::FeatherBlend),
            ("stitch", MergeMethod::Stitch),
        ] {
            assert_eq!(name.parse::<MergeMethod>().unwrap(), method);
            assert_eq!(method.as_str(), name);
        }
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn object_store_defaults_are_sane() {
        let c = ObjectStoreConfig::default();
        assert!(c.multipart_threshold_bytes > 0);
        assert!(c.upload_timeout_secs > 0);
    }

    #[test]
    fn duplicate_cameras_rejected() {
        let mut config = Config::default();
        config.capture.camera_ids = ["/dev/video0".into(), "/dev/video0".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_logo_corner_rejected() {
        let mut config = Config::default();
        for _ in 0..2 {
            config.postprocess.logos.push(LogoOverlay {
                path: "/opt/brand/logo.png".into(),
                corner: Corner::Tr,
                width: 160,
                height: 90,
                required: false,
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_preserves_sections() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.capture.camera_ids, config.capture.camera_ids);
        assert_eq!(back.merge.method, config.merge.method);
        assert_eq!(back.workspace_root, config.workspace_root);
    }
}
