//! `TagDetector` on top of the AprilRobotics C detector.

use crate::{DetectRequest, TagDetector};
use apriltag::{Detector, DetectorBuilder, Family, Image, TagParams};
use nalgebra::{Matrix3, Vector3};
use tagpose_core::{GrayImageView, TagDetection, TagPose};

#[derive(thiserror::Error, Debug)]
pub enum AprilTagError {
    #[error("unknown tag family `{0}`")]
    UnknownFamily(String),
    #[error("failed to build the apriltag detector: {0}")]
    Build(String),
}

pub struct AprilTagDetector {
    detector: Detector,
    family: String,
}

impl AprilTagDetector {
    /// `family` uses the AprilRobotics names (`tag36h11`, `tag16h5`, ...).
    pub fn new(family: &str, threads: usize, quad_decimate: f32) -> Result<Self, AprilTagError> {
        let fam: Family = family
            .parse()
            .map_err(|_| AprilTagError::UnknownFamily(family.to_string()))?;
        let mut detector = DetectorBuilder::new()
            .add_family_bits(fam, 1)
            .build()
            .map_err(|e| AprilTagError::Build(format!("{e:?}")))?;
        detector.set_thread_number(threads.clamp(1, u8::MAX as usize) as u8);
        detector.set_decimation(quad_decimate);
        log::debug!("apriltag detector: family={family} threads={threads} decimate={quad_decimate}");
        Ok(Self {
            detector,
            family: family.to_string(),
        })
    }

    fn to_apriltag_image(gray: &GrayImageView<'_>) -> Option<Image> {
        let mut image = Image::zeros_with_stride(gray.width, gray.height, gray.width).ok()?;
        for (y, row) in gray.data.chunks_exact(gray.width).enumerate() {
            for (x, px) in row.iter().enumerate() {
                image[(x, y)] = *px;
            }
        }
        Some(image)
    }
}

impl TagDetector for AprilTagDetector {
    fn detect(&mut self, gray: &GrayImageView<'_>, request: &DetectRequest) -> Vec<TagDetection> {
        if gray.width == 0 || gray.height == 0 {
            return Vec::new();
        }
        let Some(image) = Self::to_apriltag_image(gray) else {
            log::warn!("could not allocate a {}x{} detector image", gray.width, gray.height);
            return Vec::new();
        };
        let params = request
            .camera
            .filter(|_| request.estimate_pose)
            .map(|cam| TagParams {
                tagsize: request.tag_size,
                fx: cam.fx,
                fy: cam.fy,
                cx: cam.cx,
                cy: cam.cy,
            });

        self.detector
            .detect(&image)
            .into_iter()
            .map(|det| {
                let pose = params.as_ref().and_then(|p| det.estimate_tag_pose(p)).map(|pose| {
                    TagPose {
                        rotation: Matrix3::from_row_slice(pose.rotation().data()),
                        translation: Vector3::from_column_slice(pose.translation().data()),
                    }
                });
                TagDetection {
                    family: self.family.clone(),
                    id: det.id() as u32,
                    hamming: det.hamming() as u32,
                    decision_margin: det.decision_margin(),
                    center: det.center(),
                    corners: det.corners(),
                    pose,
                }
            })
            .collect()
    }
}
