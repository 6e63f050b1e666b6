//! Camera calibration for the tagpose pipeline.
//!
//! Current focus:
//! - loading and persisting the calibration record (`CalibrationStore`),
//! - a planar checkerboard solver (DLT homographies, Zhang closed form,
//!   linear distortion fit, Levenberg-Marquardt refinement),
//! - an operator-supervised capture session that collects checkerboard views
//!   from a `FrameSource` and writes the result back to the store.
//!
//! Corner finding is delegated to a `CheckerboardFinder`. With the
//! `chessboard` feature, `ChessCornerFinder` runs the `calib-targets`
//! ChESS + chessboard detector.

mod board;
#[cfg(feature = "chessboard")]
mod finder;
mod procedure;
mod review;
pub mod solver;
mod store;

pub use board::{BoardObservation, CheckerboardFinder, CheckerboardSpec};
#[cfg(feature = "chessboard")]
pub use finder::ChessCornerFinder;
pub use procedure::{
    CalibrationError, CalibrationOptions, CalibrationReport, CalibrationSession, Calibrator,
};
pub use review::{AcceptAll, ConsoleReview, ObservationReview, ReviewDecision};
pub use solver::{PlanarCalibration, PlanarView, SolverError, SolverOptions};
pub use store::{CalibrationStore, FileCalibrationStore, MemoryCalibrationStore, StoreError};
