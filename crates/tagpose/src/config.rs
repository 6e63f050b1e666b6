//! Pipeline configuration and its JSON helpers.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tagpose_calib::{CalibrationOptions, FileCalibrationStore, SolverOptions};
use tagpose_core::CameraParams;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which capture driver produces frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureBackend {
    /// USB webcam by device index.
    Usb {
        #[serde(default)]
        index: u32,
    },
    /// Raspberry Pi ribbon-cable camera.
    Ribbon,
    /// Every image file in `dir`, in lexical order.
    ImageSequence {
        dir: PathBuf,
        /// Restart from the first image instead of reporting exhaustion.
        #[serde(default)]
        looping: bool,
    },
}

impl Default for CaptureBackend {
    fn default() -> Self {
        CaptureBackend::Usb { index: 0 }
    }
}

fn default_resolution() -> [usize; 2] {
    [480, 240]
}

fn default_checker_square_size() -> f64 {
    0.02261
}

fn default_inner_corners() -> [usize; 2] {
    [9, 6]
}

fn default_calibration_views() -> usize {
    10
}

fn default_calibration_max_frames() -> usize {
    1000
}

fn default_max_reprojection_error() -> f64 {
    2.0
}

fn default_max_calibration_attempts() -> usize {
    2
}

fn default_undistort_alpha() -> f64 {
    1.0
}

fn default_tag_size() -> f64 {
    0.0405
}

fn default_tag_family() -> String {
    "tag36h11".to_string()
}

fn default_detector_threads() -> usize {
    4
}

fn default_quad_decimate() -> f32 {
    1.0
}

fn default_calibration_path() -> PathBuf {
    PathBuf::from(FileCalibrationStore::DEFAULT_PATH)
}

/// Everything the pose pipeline needs to know up front. Immutable once the
/// pipeline is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capture resolution `[width, height]` used for calibration,
    /// undistortion and detection. Recalibrate after changing it.
    #[serde(default = "default_resolution")]
    pub resolution: [usize; 2],
    #[serde(default)]
    pub capture: CaptureBackend,
    /// Checkerboard square edge in meters. Sets the unit of every pose.
    #[serde(default = "default_checker_square_size")]
    pub checker_square_size: f64,
    /// Inner corners `[cols, rows]`; the OpenCV `pattern.png` is `[9, 6]`.
    #[serde(default = "default_inner_corners")]
    pub checkerboard_inner_corners: [usize; 2],
    #[serde(default = "default_calibration_views")]
    pub calibration_views: usize,
    #[serde(default = "default_calibration_max_frames")]
    pub calibration_max_frames: usize,
    /// Calibrations above this RMS reprojection error (pixels) are rejected.
    #[serde(default = "default_max_reprojection_error")]
    pub max_reprojection_error: f64,
    /// Calibration procedure runs per `calibrate()` call. Each successful
    /// run is followed by another load of the stored record.
    #[serde(default = "default_max_calibration_attempts")]
    pub max_calibration_attempts: usize,
    /// 0 keeps only valid pixels, 1 keeps every source pixel.
    #[serde(default = "default_undistort_alpha")]
    pub undistort_alpha: f64,
    /// Tag edge length in meters (black border to black border).
    #[serde(default = "default_tag_size")]
    pub tag_size: f64,
    #[serde(default = "default_tag_family")]
    pub tag_family: String,
    #[serde(default = "default_detector_threads")]
    pub detector_threads: usize,
    #[serde(default = "default_quad_decimate")]
    pub quad_decimate: f32,
    /// Skip calibration and use these intrinsics on raw frames.
    #[serde(default)]
    pub manual_camera_params: Option<CameraParams>,
    #[serde(default = "default_calibration_path")]
    pub calibration_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            capture: CaptureBackend::default(),
            checker_square_size: default_checker_square_size(),
            checkerboard_inner_corners: default_inner_corners(),
            calibration_views: default_calibration_views(),
            calibration_max_frames: default_calibration_max_frames(),
            max_reprojection_error: default_max_reprojection_error(),
            max_calibration_attempts: default_max_calibration_attempts(),
            undistort_alpha: default_undistort_alpha(),
            tag_size: default_tag_size(),
            tag_family: default_tag_family(),
            detector_threads: default_detector_threads(),
            quad_decimate: default_quad_decimate(),
            manual_camera_params: None,
            calibration_path: default_calibration_path(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a JSON config. Missing fields take their defaults.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let [w, h] = self.resolution;
        if w == 0 || h == 0 {
            return invalid(format!("resolution must be non-zero, got {w}x{h}"));
        }
        if !(self.checker_square_size.is_finite() && self.checker_square_size > 0.0) {
            return invalid(format!(
                "checker_square_size must be positive, got {}",
                self.checker_square_size
            ));
        }
        if !(self.tag_size.is_finite() && self.tag_size > 0.0) {
            return invalid(format!("tag_size must be positive, got {}", self.tag_size));
        }
        let [cols, rows] = self.checkerboard_inner_corners;
        if cols < 2 || rows < 2 {
            return invalid(format!(
                "checkerboard_inner_corners must be at least [2, 2], got [{cols}, {rows}]"
            ));
        }
        if !(0.0..=1.0).contains(&self.undistort_alpha) {
            return invalid(format!(
                "undistort_alpha must lie in [0, 1], got {}",
                self.undistort_alpha
            ));
        }
        if !(self.max_reprojection_error > 0.0) {
            return invalid(format!(
                "max_reprojection_error must be positive, got {}",
                self.max_reprojection_error
            ));
        }
        if self.max_calibration_attempts == 0 {
            return invalid("max_calibration_attempts must be at least 1".to_string());
        }
        if self.detector_threads == 0 {
            return invalid("detector_threads must be at least 1".to_string());
        }
        if !(self.quad_decimate >= 1.0) {
            return invalid(format!(
                "quad_decimate must be >= 1, got {}",
                self.quad_decimate
            ));
        }
        if let Some(cam) = &self.manual_camera_params {
            if !cam.is_valid() {
                return invalid(format!("manual_camera_params are not usable: {cam:?}"));
            }
        }
        Ok(())
    }

    pub fn resolution(&self) -> (usize, usize) {
        (self.resolution[0], self.resolution[1])
    }

    /// Options for a checkerboard calibration session.
    pub fn calibration_options(&self) -> CalibrationOptions {
        CalibrationOptions {
            inner_cols: self.checkerboard_inner_corners[0],
            inner_rows: self.checkerboard_inner_corners[1],
            required_views: self.calibration_views,
            max_frames: self.calibration_max_frames,
            max_rms: self.max_reprojection_error,
            solver: SolverOptions::default(),
        }
    }
}
