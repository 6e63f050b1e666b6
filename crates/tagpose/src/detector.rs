use tagpose_core::{CameraParams, GrayImageView, TagDetection};

/// What the pipeline asks of a detector for one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectRequest {
    pub estimate_pose: bool,
    /// Intrinsics as stored in the calibration record or configured.
    pub camera: Option<CameraParams>,
    /// Tag edge length in meters.
    pub tag_size: f64,
}

/// Fiducial detector. Pixel processing and pose solving live entirely
/// behind this seam.
pub trait TagDetector {
    /// Detect tags in a gray frame. Returns an empty list when nothing is
    /// seen. Poses are filled only when `request.estimate_pose` is set and a
    /// camera is provided.
    fn detect(&mut self, gray: &GrayImageView<'_>, request: &DetectRequest) -> Vec<TagDetection>;
}

impl<D: TagDetector + ?Sized> TagDetector for Box<D> {
    fn detect(&mut self, gray: &GrayImageView<'_>, request: &DetectRequest) -> Vec<TagDetection> {
        (**self).detect(gray, request)
    }
}
