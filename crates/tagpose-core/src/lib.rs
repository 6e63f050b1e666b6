//! Core types and utilities for the tagpose pipeline.
//!
//! This crate is intentionally small and purely geometric. It knows about the
//! pinhole camera model, Brown-Conrady lens distortion, and plain RGB / gray
//! pixel buffers. It does *not* depend on any concrete camera driver, tag
//! detector or image codec; those live behind the traits declared here and in
//! the higher-level crates.

mod camera;
mod capture;
mod image;
mod logger;
mod tag;
mod undistort;

pub use camera::{CalibrationParameters, CameraModelError, CameraParams, Distortion};
pub use capture::{CaptureError, FrameSource};
pub use image::{ColorFrame, GrayImage, GrayImageView};
pub use tag::{TagDetection, TagPose};
pub use undistort::{optimal_new_camera_matrix, UndistortError, Undistorter};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
