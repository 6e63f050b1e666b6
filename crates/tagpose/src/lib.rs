//! Calibrated fiducial pose pipeline.
//!
//! `tagpose` ties a frame source, a camera calibration and an AprilTag
//! detector together so that a robot can read tag positions in meters and
//! relay them to a microcontroller.
//!
//! ## Quickstart
//!
//! ```no_run
//! use tagpose::{PipelineConfig, PosePipeline};
//! # use tagpose::{DetectRequest, TagDetector};
//! # use tagpose::core::{GrayImageView, TagDetection};
//! # struct MyDetector;
//! # impl TagDetector for MyDetector {
//! #     fn detect(&mut self, _: &GrayImageView<'_>, _: &DetectRequest) -> Vec<TagDetection> { Vec::new() }
//! # }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::load_json("tagpose.json")?;
//! let source = tagpose::open_capture(&config)?;
//! let mut pipeline = PosePipeline::new(config, source, MyDetector)?;
//! pipeline.calibrate();
//! for tag in pipeline.get_tags()? {
//!     println!("tag {} at {:?}", tag.id, tag.translation_mm());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `tagpose::core`: camera model, undistortion, frames, detections.
//! - `tagpose::calib`: calibration store, planar solver, capture session.
//! - [`PosePipeline`]: the `Uncalibrated -> Calibrating -> Ready` state
//!   machine and per-frame `get_tags()`.
//! - [`TagDetector`], [`Transport`]: collaborator seams; `AprilTagDetector`
//!   (feature `apriltag`) and [`LineTransport`] implement them.

pub use tagpose_calib as calib;
pub use tagpose_core as core;

#[cfg(feature = "apriltag")]
mod apriltag_detector;
mod capture;
mod config;
mod detector;
mod pipeline;
mod transport;

#[cfg(feature = "apriltag")]
pub use apriltag_detector::{AprilTagDetector, AprilTagError};
pub use capture::{open_capture, ImageSequenceSource};
pub use config::{CaptureBackend, ConfigError, PipelineConfig};
pub use detector::{DetectRequest, TagDetector};
pub use pipeline::{CameraState, Phase, PipelineError, PosePipeline, Transition};
pub use transport::{LineTransport, Transport, TransportError};
