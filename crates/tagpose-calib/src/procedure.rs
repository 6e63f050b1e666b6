//! Checkerboard capture session: collect views from a frame source, solve,
//! gate on reprojection error and persist.

use crate::solver::{self, PlanarView, SolverError, SolverOptions};
use crate::{
    CalibrationStore, CheckerboardFinder, CheckerboardSpec, ObservationReview, ReviewDecision,
    StoreError,
};
use tagpose_core::{CalibrationParameters, CaptureError, FrameSource};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("calibration aborted by operator after {accepted} views")]
    Aborted { accepted: usize },
    #[error("collected {got} checkerboard views, need {need}")]
    NotEnoughViews { got: usize, need: usize },
    #[error("invalid checkerboard: {0}")]
    InvalidBoard(String),
    #[error("reprojection error {rms:.3}px exceeds the {max:.3}px limit")]
    ReprojectionTooHigh { rms: f64, max: f64 },
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Computes and persists a calibration record from live frames.
pub trait Calibrator {
    fn calibrate(
        &mut self,
        source: &mut dyn FrameSource,
        square_size: f64,
        store: &mut dyn CalibrationStore,
    ) -> Result<CalibrationReport, CalibrationError>;
}

impl<C: Calibrator + ?Sized> Calibrator for Box<C> {
    fn calibrate(
        &mut self,
        source: &mut dyn FrameSource,
        square_size: f64,
        store: &mut dyn CalibrationStore,
    ) -> Result<CalibrationReport, CalibrationError> {
        (**self).calibrate(source, square_size, store)
    }
}

#[derive(Clone, Debug)]
pub struct CalibrationOptions {
    pub inner_cols: usize,
    pub inner_rows: usize,
    /// Accepted views needed before solving.
    pub required_views: usize,
    /// Frames pulled before the session gives up.
    pub max_frames: usize,
    /// Largest acceptable RMS reprojection error, in pixels.
    pub max_rms: f64,
    pub solver: SolverOptions,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            inner_cols: 9,
            inner_rows: 6,
            required_views: 10,
            max_frames: 1000,
            max_rms: 2.0,
            solver: SolverOptions::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CalibrationReport {
    /// The record that was written to the store.
    pub parameters: CalibrationParameters,
    pub rms_error: f64,
    pub per_view_rms: Vec<f64>,
    pub views: usize,
    pub frames_read: usize,
}

/// Interactive (or unattended, with [`crate::AcceptAll`]) calibration
/// session.
pub struct CalibrationSession<F, R> {
    finder: F,
    review: R,
    options: CalibrationOptions,
}

impl<F: CheckerboardFinder, R: ObservationReview> CalibrationSession<F, R> {
    pub fn new(finder: F, review: R, options: CalibrationOptions) -> Self {
        Self {
            finder,
            review,
            options,
        }
    }

    pub fn options(&self) -> &CalibrationOptions {
        &self.options
    }

    /// Pull frames until enough boards were accepted. Returns the views and
    /// the image size they were observed at.
    fn collect(
        &mut self,
        source: &mut dyn FrameSource,
        spec: &CheckerboardSpec,
    ) -> Result<(Vec<PlanarView>, (usize, usize), usize), CalibrationError> {
        let board = spec.board_points();
        let need = self.options.required_views;
        let mut views = Vec::with_capacity(need);
        let mut image_size = source.resolution();
        let mut frames = 0;

        while views.len() < need && frames < self.options.max_frames {
            frames += 1;
            let frame = match source.read() {
                Ok(frame) => frame,
                Err(CaptureError::Exhausted) => {
                    log::info!("frame source exhausted after {frames} frames");
                    break;
                }
                Err(e) => {
                    log::debug!("skipping frame {frames}: {e}");
                    continue;
                }
            };

            let gray = frame.to_gray();
            let Some(observation) = self.finder.find(&gray.view(), spec) else {
                continue;
            };
            if observation.corners.len() != board.len() {
                log::warn!(
                    "finder returned {} corners for a {}-corner board; ignored",
                    observation.corners.len(),
                    board.len()
                );
                continue;
            }

            match self.review.review(&frame, &observation, views.len()) {
                ReviewDecision::Accept => {
                    image_size = (frame.width, frame.height);
                    views.push(PlanarView::new(board.clone(), observation.corners));
                    log::info!("accepted view {}/{}", views.len(), need);
                }
                ReviewDecision::Skip => log::debug!("view skipped by operator"),
                ReviewDecision::Abort => {
                    return Err(CalibrationError::Aborted {
                        accepted: views.len(),
                    })
                }
            }
        }

        if views.len() < need {
            return Err(CalibrationError::NotEnoughViews {
                got: views.len(),
                need,
            });
        }
        Ok((views, image_size, frames))
    }
}

impl<F: CheckerboardFinder, R: ObservationReview> Calibrator for CalibrationSession<F, R> {
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, source, store))
    )]
    fn calibrate(
        &mut self,
        source: &mut dyn FrameSource,
        square_size: f64,
        store: &mut dyn CalibrationStore,
    ) -> Result<CalibrationReport, CalibrationError> {
        if !(square_size.is_finite() && square_size > 0.0) {
            return Err(CalibrationError::InvalidBoard(format!(
                "square size must be positive, got {square_size}"
            )));
        }
        let (cols, rows) = (self.options.inner_cols, self.options.inner_rows);
        if cols < 2 || rows < 2 {
            return Err(CalibrationError::InvalidBoard(format!(
                "need at least 2x2 inner corners, got {cols}x{rows}"
            )));
        }
        let spec = CheckerboardSpec::new(cols, rows, square_size);
        log::info!(
            "calibration started: {}x{} inner corners, square {} m, {} views needed",
            cols,
            rows,
            square_size,
            self.options.required_views
        );

        let (views, image_size, frames_read) = self.collect(source, &spec)?;
        let solved = solver::calibrate_planar(&views, image_size, &self.options.solver)?;
        if solved.rms_error > self.options.max_rms {
            return Err(CalibrationError::ReprojectionTooHigh {
                rms: solved.rms_error,
                max: self.options.max_rms,
            });
        }

        let parameters = solved.to_parameters(image_size);
        store.save(&parameters)?;
        log::info!(
            "calibration saved: rms {:.3}px over {} views",
            solved.rms_error,
            views.len()
        );

        Ok(CalibrationReport {
            parameters,
            rms_error: solved.rms_error,
            per_view_rms: solved.per_view_rms,
            views: views.len(),
            frames_read,
        })
    }
}
