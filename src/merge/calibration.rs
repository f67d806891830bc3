//! Stitch calibration: a stored homography mapping right-camera pixel
//! space into left-camera pixel space, with provenance. Read-only at
//! runtime; absence or invalidity disables the stitch path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration missing at {0:?}")]
    Missing(std::path::PathBuf),

    #[error("failed to read calibration {path:?}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse calibration {path:?}: {reason}")]
    Parse {
        path: std::path::PathBuf,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calibration {
    /// Row-major 3x3 homography
    pub homography: [[f64; 3]; 3],

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub feature_count: Option<u32>,

    #[serde(default)]
    pub inlier_ratio: Option<f64>,
}

impl Calibration {
    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        if !path.exists() {
            return Err(CalibrationError::Missing(path.to_path_buf()));
        }
        let bytes = std::fs::read(path).map_err(|source| CalibrationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| CalibrationError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn determinant(&self) -> f64 {
        let m = &self.homography;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Project a right-frame pixel into left-frame coordinates
    pub fn project(&self, x: f64, y: f64) -> (f64, f64) {
        let m = &self.homography;
        let w = m[2][0] * x + m[2][1] * y + m[2][2];
        // A vanishing denominator means the point maps to infinity; report
        // an absurd coordinate so the canvas check rejects it.
        if w.abs() < 1e-9 {
            return (f64::INFINITY, f64::INFINITY);
        }
        (
            (m[0][0] * x + m[0][1] * y + m[0][2]) / w,
            (m[1][0] * x + m[1][1] * y + m[1][2]) / w,
        )
    }

    /// Projected corners of a `width` x `height` right frame, in order
    /// top-left, top-right, bottom-left, bottom-right.
    pub fn projected_corners(&self, width: f64, height: f64) -> [(f64, f64); 4] {
        [
            self.project(0.0, 0.0),
            self.project(width, 0.0),
            self.project(0.0, height),
            self.project(width, height),
        ]
    }

    /// Gate before the warp is attempted: a near-singular or wildly
    /// scaling homography, or one that throws the frame off the merge
    /// canvas, forces the feather-blend fallback.
    pub fn validate(&self, frame_width: u32, frame_height: u32) -> Result<(), String> {
        let det = self.determinant();
        if !(0.5..=2.0).contains(&det) {
            return Err(format!("determinant {det:.3} outside [0.5, 2.0]"));
        }

        let w = frame_width as f64;
        let h = frame_height as f64;
        // Canvas of the merged output: both frames side by side, with 10%
        // slack for the warp.
        let (min_x, max_x) = (-0.1 * w, 2.2 * w);
        let (min_y, max_y) = (-0.1 * h, 1.1 * h);

        for (i, (x, y)) in self.projected_corners(w, h).iter().enumerate() {
            if !x.is_finite()
                || !y.is_finite()
                || *x < min_x
                || *x > max_x
                || *y < min_y
                || *y > max_y
            {
                return Err(format!(
                    "corner {i} projects to ({x:.1}, {y:.1}), outside the canvas"
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Calibration {
        Calibration {
            homography: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            created_at: None,
            feature_count: Some(420),
            inlier_ratio: Some(0.92),
        }
    }

    /// A plausible stitch transform: slight rotation and a rightward shift
    fn translation(dx: f64) -> Calibration {
        Calibration {
            homography: [[1.0, 0.0, dx], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            ..identity()
        }
    }

    #[test]
    fn determinant_of_identity_is_one() {
        assert!((identity().determinant() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn projection_applies_translation() {
        let cal = translation(800.0);
        assert_eq!(cal.project(100.0, 50.0), (900.0, 50.0));
    }

    #[test]
    fn validate_accepts_reasonable_shift() {
        translation(1700.0).validate(1920, 1080).unwrap();
    }

    #[test]
    fn validate_rejects_degenerate_scale() {
        let mut cal = identity();
        cal.homography[0][0] = 0.1;
        let err = cal.validate(1920, 1080).unwrap_err();
        assert!(err.contains("determinant"));
    }

    #[test]
    fn validate_rejects_offcanvas_projection() {
        let err = translation(5000.0).validate(1920, 1080).unwrap_err();
        assert!(err.contains("outside the canvas"));
    }

    #[test]
    fn validate_rejects_singular_matrix() {
        let mut cal = identity();
        cal.homography[2][2] = 0.0;
        cal.homography[2][0] = 0.0;
        cal.homography[2][1] = 0.0;
        assert!(cal.validate(1920, 1080).is_err());
    }

    #[test]
    fn load_parses_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        std::fs::write(
            &path,
            r#"{
                "homography": [[1,0,1650],[0,1,4],[0,0,1]],
                "created_at": "2026-07-30T10:00:00Z",
                "feature_count": 812,
                "inlier_ratio": 0.87
            }"#,
        )
        .unwrap();

        let cal = Calibration::load(&path).unwrap();
        assert_eq!(cal.feature_count, Some(812));
        assert_eq!(cal.project(0.0, 0.0), (1650.0, 4.0));
    }

    #[test]
    fn load_missing_is_distinct_from_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            Calibration::load(&missing),
            Err(CalibrationError::Missing(_))
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{").unwrap();
        assert!(matches!(
            Calibration::load(&bad),
            Err(CalibrationError::Parse { .. })
        ));
    }
}
