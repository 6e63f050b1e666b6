//! Calibration state machine and per-frame tag detection.

use crate::{ConfigError, DetectRequest, PipelineConfig, TagDetector};
use std::fmt;
use tagpose_calib::{CalibrationStore, Calibrator, FileCalibrationStore};
use tagpose_core::{
    CalibrationParameters, CameraParams, CaptureError, FrameSource, TagDetection, UndistortError,
    Undistorter,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Undistort(#[from] UndistortError),
    #[error("frame is {got_w}x{got_h}, pipeline is configured for {want_w}x{want_h}")]
    FrameSize {
        got_w: usize,
        got_h: usize,
        want_w: usize,
        want_h: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uncalibrated,
    Calibrating,
    Ready,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Uncalibrated => "uncalibrated",
            Phase::Calibrating => "calibrating",
            Phase::Ready => "ready",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub reason: String,
}

/// What the pipeline knows about the camera.
#[derive(Clone, Debug)]
pub enum CameraState {
    Uncalibrated,
    Calibrated {
        /// Intrinsics as stored or configured; handed to the detector.
        camera: CameraParams,
        /// Remap for stored calibrations. Manual parameters run on raw frames.
        undistorter: Option<Box<Undistorter>>,
    },
}

impl CameraState {
    pub fn is_calibrated(&self) -> bool {
        matches!(self, CameraState::Calibrated { .. })
    }
}

/// Frame source + calibration + detector.
///
/// Start with [`PosePipeline::calibrate`], then call
/// [`PosePipeline::get_tags`] once per frame.
pub struct PosePipeline<S, D> {
    config: PipelineConfig,
    source: S,
    detector: D,
    store: Box<dyn CalibrationStore>,
    calibrator: Option<Box<dyn Calibrator>>,
    state: CameraState,
    phase: Phase,
    transitions: Vec<Transition>,
}

impl<S: FrameSource, D: TagDetector> PosePipeline<S, D> {
    /// Build a pipeline reading its calibration record from
    /// `config.calibration_path`. With the `chessboard` feature a missing
    /// record triggers an unattended checkerboard session; otherwise attach
    /// one with [`Self::with_calibrator`].
    pub fn new(config: PipelineConfig, source: S, detector: D) -> Result<Self, PipelineError> {
        config.validate()?;
        let store = FileCalibrationStore::new(config.calibration_path.clone());
        let calibrator = default_calibrator(&config);
        let mut pipeline = Self {
            config,
            source,
            detector,
            store: Box::new(store),
            calibrator,
            state: CameraState::Uncalibrated,
            phase: Phase::Uncalibrated,
            transitions: Vec::new(),
        };

        if let Some(camera) = pipeline.config.manual_camera_params {
            pipeline.state = CameraState::Calibrated {
                camera,
                undistorter: None,
            };
            pipeline.transition(Phase::Ready, "manual camera parameters configured");
        }
        Ok(pipeline)
    }

    pub fn with_store(mut self, store: impl CalibrationStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    pub fn with_calibrator(mut self, calibrator: impl Calibrator + 'static) -> Self {
        self.calibrator = Some(Box::new(calibrator));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &CameraState {
        &self.state
    }

    /// Raw camera intrinsics once calibrated.
    pub fn camera_params(&self) -> Option<CameraParams> {
        match &self.state {
            CameraState::Calibrated { camera, .. } => Some(*camera),
            CameraState::Uncalibrated => None,
        }
    }

    pub fn undistorter(&self) -> Option<&Undistorter> {
        match &self.state {
            CameraState::Calibrated { undistorter, .. } => undistorter.as_deref(),
            CameraState::Uncalibrated => None,
        }
    }

    /// Every phase change so far, oldest first.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    fn transition(&mut self, to: Phase, reason: impl Into<String>) {
        let reason = reason.into();
        log::info!("pipeline {} -> {}: {}", self.phase, to, reason);
        self.transitions.push(Transition {
            from: self.phase,
            to,
            reason,
        });
        self.phase = to;
    }

    /// Load the stored calibration, computing it first if there is none.
    ///
    /// Returns `true` once the pipeline is `Ready`. Failures leave the
    /// pipeline `Uncalibrated` with operator guidance in the log; nothing is
    /// raised. A no-op when already `Ready`.
    #[cfg_attr(feature = "tracing", instrument(level = "info", skip(self)))]
    pub fn calibrate(&mut self) -> bool {
        if self.phase == Phase::Ready {
            log::debug!("calibrate() ignored: pipeline already ready");
            return true;
        }

        let max_runs = self.config.max_calibration_attempts;
        let mut runs = 0;
        loop {
            if let Some(record) = self.store.load() {
                return self.apply_record(record);
            }
            if runs == max_runs {
                log::warn!(
                    "no calibration record at {} after {} calibration run(s); delete the \
                     record and recalibrate, or set manual_camera_params",
                    self.config.calibration_path.display(),
                    runs
                );
                if self.phase != Phase::Uncalibrated {
                    self.transition(Phase::Uncalibrated, "calibration record still missing");
                }
                return false;
            }
            runs += 1;

            if self.phase != Phase::Calibrating {
                self.transition(Phase::Calibrating, "no stored calibration");
            }
            let Some(calibrator) = self.calibrator.as_mut() else {
                log::warn!(
                    "no calibration procedure available; build with the `chessboard` \
                     feature, attach a calibrator, or set manual_camera_params"
                );
                self.transition(Phase::Uncalibrated, "no calibration procedure");
                return false;
            };

            log::info!(
                "running camera calibration: print the {}x{} inner-corner checkerboard, \
                 square {} m, and show it to the camera at varied angles",
                self.config.checkerboard_inner_corners[0],
                self.config.checkerboard_inner_corners[1],
                self.config.checker_square_size
            );
            match calibrator.calibrate(
                &mut self.source,
                self.config.checker_square_size,
                self.store.as_mut(),
            ) {
                Ok(report) => log::info!(
                    "calibration run {} finished: rms {:.3}px from {} views",
                    runs,
                    report.rms_error,
                    report.views
                ),
                Err(e) => {
                    log::warn!(
                        "camera calibration failed: {e}. Check lighting and board \
                         flatness, then call calibrate() again"
                    );
                    self.transition(Phase::Uncalibrated, format!("calibration failed: {e}"));
                    return false;
                }
            }
        }
    }

    fn apply_record(&mut self, record: CalibrationParameters) -> bool {
        let resolution = self.config.resolution();
        if let Some([w, h]) = record.image_size {
            if (w as usize, h as usize) != resolution {
                log::warn!(
                    "calibration was computed at {}x{} but capture runs at {}x{}; \
                     recalibrate after changing the resolution",
                    w,
                    h,
                    resolution.0,
                    resolution.1
                );
            }
        }

        match Undistorter::new(&record, resolution, self.config.undistort_alpha) {
            Ok(undistorter) => {
                self.state = CameraState::Calibrated {
                    camera: record.camera_params(),
                    undistorter: Some(Box::new(undistorter)),
                };
                self.transition(Phase::Ready, "calibration loaded");
                true
            }
            Err(e) => {
                log::warn!("stored calibration is unusable: {e}; delete it and recalibrate");
                if self.phase != Phase::Uncalibrated {
                    self.transition(Phase::Uncalibrated, format!("unusable calibration: {e}"));
                }
                false
            }
        }
    }

    /// Capture one frame and detect tags in it.
    ///
    /// While uncalibrated the frame is still captured but no detection runs
    /// and the result is empty, whatever the frame size.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self)))]
    pub fn get_tags(&mut self) -> Result<Vec<TagDetection>, PipelineError> {
        let frame = self.source.read()?;
        let CameraState::Calibrated { camera, undistorter } = &self.state else {
            log::warn!("no camera matrix: set manual_camera_params or call calibrate() before detecting tags");
            return Ok(Vec::new());
        };

        let (want_w, want_h) = self.config.resolution();
        if (frame.width, frame.height) != (want_w, want_h) {
            return Err(PipelineError::FrameSize {
                got_w: frame.width,
                got_h: frame.height,
                want_w,
                want_h,
            });
        }
        let frame = match undistorter {
            Some(u) => u.apply(&frame)?,
            None => frame,
        };
        let gray = frame.to_gray();
        let request = DetectRequest {
            estimate_pose: true,
            camera: Some(*camera),
            tag_size: self.config.tag_size,
        };
        let tags = self.detector.detect(&gray.view(), &request);
        log::trace!("{} tag(s) detected", tags.len());
        Ok(tags)
    }
}

#[cfg(feature = "chessboard")]
fn default_calibrator(config: &PipelineConfig) -> Option<Box<dyn Calibrator>> {
    use tagpose_calib::{AcceptAll, CalibrationSession, ChessCornerFinder};
    Some(Box::new(CalibrationSession::new(
        ChessCornerFinder::new(),
        AcceptAll,
        config.calibration_options(),
    )))
}

#[cfg(not(feature = "chessboard"))]
fn default_calibrator(_: &PipelineConfig) -> Option<Box<dyn Calibrator>> {
    None
}
