use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Tag pose in the camera optical frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagPose {
    /// Rotation from tag frame to camera frame.
    pub rotation: Matrix3<f64>,
    /// Tag center in meters (x right, y down, z forward).
    pub translation: Vector3<f64>,
}

/// One fiducial seen in one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagDetection {
    /// Tag family name, e.g. `tag36h11`.
    pub family: String,
    pub id: u32,
    /// Number of bits corrected while decoding.
    pub hamming: u32,
    pub decision_margin: f32,
    /// Tag center in pixel coordinates of the (undistorted) frame.
    pub center: [f64; 2],
    /// Pixel corners, counter-clockwise starting bottom-left of the tag.
    pub corners: [[f64; 2]; 4],
    /// Present only when pose estimation was requested and succeeded.
    pub pose: Option<TagPose>,
}

impl TagDetection {
    pub fn rotation(&self) -> Option<&Matrix3<f64>> {
        self.pose.as_ref().map(|p| &p.rotation)
    }

    /// Translation in meters.
    pub fn translation(&self) -> Option<&Vector3<f64>> {
        self.pose.as_ref().map(|p| &p.translation)
    }

    /// Translation in millimeters.
    pub fn translation_mm(&self) -> Option<Vector3<f64>> {
        self.translation().map(|t| t * 1000.0)
    }

    /// Translation in millimeters after rounding the meter values to four
    /// decimals, i.e. a 0.1 mm display resolution.
    pub fn translation_mm_display(&self) -> Option<Vector3<f64>> {
        self.translation()
            .map(|t| t.map(|v| (v * 1e4).round() / 1e4 * 1000.0))
    }
}
