//! Planar (checkerboard) camera calibration.
//!
//! Pipeline:
//! 1. per-view homography board -> image (normalized DLT),
//! 2. closed-form intrinsics from the homographies (Zhang, zero skew),
//! 3. alternate a linear Brown-Conrady fit on homography residuals with
//!    intrinsics re-estimation on undistorted pixels,
//! 4. decompose each homography into a board pose,
//! 5. Levenberg-Marquardt on the full reprojection error.

mod distortion;
mod homography;
mod refine;
mod zhang;

use nalgebra::{Isometry3, Matrix3, Point2, Vector3};
use tagpose_core::{CalibrationParameters, CameraParams, Distortion};

#[cfg(feature = "tracing")]
use tracing::instrument;

pub use distortion::estimate_distortion;
pub use homography::estimate_homography;
pub use refine::project_point;
pub use zhang::intrinsics_from_homographies;

/// Minimum number of views for a closed-form solution.
pub const MIN_VIEWS: usize = 3;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("need at least {need} views, got {got}")]
    NotEnoughViews { got: usize, need: usize },
    #[error("view {view}: {board} board points but {image} image points")]
    MismatchedView {
        view: usize,
        board: usize,
        image: usize,
    },
    #[error("view {view}: need at least 4 points, got {got}")]
    NotEnoughPoints { view: usize, got: usize },
    #[error("view {view}: homography estimation is degenerate")]
    DegenerateHomography { view: usize },
    #[error("board views do not constrain the intrinsics (near-parallel views?)")]
    DegenerateIntrinsics,
    #[error("distortion fit is degenerate")]
    DegenerateDistortion,
    #[error("solver diverged to non-finite parameters")]
    NonFinite,
}

/// Correspondences of one board view.
#[derive(Clone, Debug)]
pub struct PlanarView {
    /// Board-plane points (`z = 0`), metric.
    pub board_points: Vec<Point2<f64>>,
    /// Observed (distorted) pixel positions.
    pub image_points: Vec<Point2<f64>>,
}

impl PlanarView {
    pub fn new(board_points: Vec<Point2<f64>>, image_points: Vec<Point2<f64>>) -> Self {
        Self {
            board_points,
            image_points,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SolverOptions {
    /// Distortion <-> intrinsics alternations of the linear initialization.
    pub linear_iterations: usize,
    /// Keep `k3` at zero. It tends to overfit on a single small board.
    pub fix_k3: bool,
    /// Keep `p1`, `p2` at zero.
    pub fix_tangential: bool,
    /// Levenberg-Marquardt patience: the evaluation budget is this times the
    /// number of free parameters plus one. Zero skips refinement.
    pub max_refine_iterations: usize,
    /// Relative cost and step tolerance (`ftol`, `xtol`).
    pub refine_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            linear_iterations: 2,
            fix_k3: true,
            fix_tangential: false,
            max_refine_iterations: 100,
            refine_tolerance: 1e-12,
        }
    }
}

/// Solved camera plus the board pose of every view.
#[derive(Clone, Debug)]
pub struct PlanarCalibration {
    pub camera: CameraParams,
    pub distortion: Distortion,
    /// Board-to-camera transform per view.
    pub poses: Vec<Isometry3<f64>>,
    /// Root mean square reprojection error over all points, in pixels.
    pub rms_error: f64,
    pub per_view_rms: Vec<f64>,
}

impl PlanarCalibration {
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.camera.to_matrix()
    }

    /// Package the result as a persistable record.
    pub fn to_parameters(&self, image_size: (usize, usize)) -> CalibrationParameters {
        let mut params = CalibrationParameters::new(self.camera_matrix(), self.distortion);
        params.image_size = Some([image_size.0 as u32, image_size.1 as u32]);
        params.rms_error = Some(self.rms_error);
        params.views = Some(self.poses.len());
        params
    }
}

fn check_views(views: &[PlanarView]) -> Result<(), SolverError> {
    if views.len() < MIN_VIEWS {
        return Err(SolverError::NotEnoughViews {
            got: views.len(),
            need: MIN_VIEWS,
        });
    }
    for (idx, v) in views.iter().enumerate() {
        if v.board_points.len() != v.image_points.len() {
            return Err(SolverError::MismatchedView {
                view: idx,
                board: v.board_points.len(),
                image: v.image_points.len(),
            });
        }
        if v.board_points.len() < 4 {
            return Err(SolverError::NotEnoughPoints {
                view: idx,
                got: v.board_points.len(),
            });
        }
    }
    Ok(())
}

fn homographies(
    views: &[PlanarView],
    pixels: impl Fn(&PlanarView) -> Vec<Point2<f64>>,
) -> Result<Vec<Matrix3<f64>>, SolverError> {
    views
        .iter()
        .enumerate()
        .map(|(view, v)| {
            estimate_homography(&v.board_points, &pixels(v))
                .ok_or(SolverError::DegenerateHomography { view })
        })
        .collect()
}

fn undistort_pixels(
    points: &[Point2<f64>],
    camera: &CameraParams,
    distortion: &Distortion,
) -> Vec<Point2<f64>> {
    points
        .iter()
        .map(|p| {
            let n = distortion.undistort_normalized(camera.pixel_to_normalized([p.x, p.y]));
            let [u, v] = camera.normalized_to_pixel(n);
            Point2::new(u, v)
        })
        .collect()
}

/// Board pose from a plane-induced homography `H ~ K [r1 r2 t]`.
pub fn pose_from_homography(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Option<Isometry3<f64>> {
    let k_inv = k.try_inverse()?;
    let a1 = k_inv * h.column(0);
    let a2 = k_inv * h.column(1);
    let a3 = k_inv * h.column(2);

    let scale = 2.0 / (a1.norm() + a2.norm());
    if !scale.is_finite() {
        return None;
    }
    // The board must sit in front of the camera.
    let sign = if a3.z * scale < 0.0 { -1.0 } else { 1.0 };
    let r1 = a1 * scale * sign;
    let r2 = a2 * scale * sign;
    let r3 = r1.cross(&r2);
    let t: Vector3<f64> = a3 * scale * sign;

    let r = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = r.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    let rotation = nalgebra::UnitQuaternion::from_matrix(&r_orth);
    Some(Isometry3::from_parts(t.into(), rotation))
}

/// Calibrate a pinhole + Brown-Conrady camera from checkerboard views.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(views, opts), fields(views = views.len()))
)]
pub fn calibrate_planar(
    views: &[PlanarView],
    image_size: (usize, usize),
    opts: &SolverOptions,
) -> Result<PlanarCalibration, SolverError> {
    check_views(views)?;

    let mut hs = homographies(views, |v| v.image_points.clone())?;
    let mut camera = intrinsics_from_homographies(&hs, image_size)?;
    let mut dist = Distortion::default();
    log::debug!(
        "zhang init: fx={:.2} fy={:.2} cx={:.2} cy={:.2}",
        camera.fx,
        camera.fy,
        camera.cx,
        camera.cy
    );

    for iter in 0..opts.linear_iterations {
        dist = estimate_distortion(&camera, views, &hs, opts)?;
        hs = homographies(views, |v| undistort_pixels(&v.image_points, &camera, &dist))?;
        camera = intrinsics_from_homographies(&hs, image_size)?;
        log::debug!(
            "linear iteration {iter}: fx={:.2} fy={:.2} k1={:.4} k2={:.4}",
            camera.fx,
            camera.fy,
            dist.k1,
            dist.k2
        );
    }
    // Homographies of undistorted pixels under the final linear camera.
    if opts.linear_iterations > 0 {
        hs = homographies(views, |v| undistort_pixels(&v.image_points, &camera, &dist))?;
    }

    let k = camera.to_matrix();
    let poses: Vec<Isometry3<f64>> = hs
        .iter()
        .enumerate()
        .map(|(view, h)| {
            pose_from_homography(&k, h).ok_or(SolverError::DegenerateHomography { view })
        })
        .collect::<Result<_, _>>()?;

    let (camera, dist, poses) = refine::refine(views, camera, dist, poses, opts)?;
    let per_view_rms: Vec<f64> = views
        .iter()
        .zip(&poses)
        .map(|(v, pose)| refine::view_rms(v, &camera, &dist, pose))
        .collect();
    let total_points: usize = views.iter().map(|v| v.board_points.len()).sum();
    let sum_sq: f64 = views
        .iter()
        .zip(&per_view_rms)
        .map(|(v, rms)| rms * rms * v.board_points.len() as f64)
        .sum();
    let rms_error = (sum_sq / total_points as f64).sqrt();
    if !rms_error.is_finite() || !camera.is_valid() {
        return Err(SolverError::NonFinite);
    }

    log::info!(
        "calibrated from {} views: fx={:.2} fy={:.2} cx={:.2} cy={:.2} rms={:.3}px",
        views.len(),
        camera.fx,
        camera.fy,
        camera.cx,
        camera.cy,
        rms_error
    );

    Ok(PlanarCalibration {
        camera,
        distortion: dist,
        poses,
        rms_error,
        per_view_rms,
    })
}

#[cfg(test)]
pub(crate) mod synthetic {
    use super::*;
    use nalgebra::{Rotation3, Translation3};

    pub fn board(cols: usize, rows: usize, square: f64) -> Vec<Point2<f64>> {
        (0..rows)
            .flat_map(|j| (0..cols).map(move |i| Point2::new(i as f64 * square, j as f64 * square)))
            .collect()
    }

    /// Board poses spread around a camera looking at a 9x6 board of 0.0226 m
    /// squares from about 0.35 m away.
    pub fn poses() -> Vec<Isometry3<f64>> {
        let tilts = [
            (0.0, 0.0, 0.0),
            (0.35, 0.0, 0.05),
            (-0.3, 0.1, -0.05),
            (0.0, 0.4, 0.1),
            (0.1, -0.35, 0.0),
            (0.25, 0.25, -0.1),
            (-0.2, -0.25, 0.15),
            (0.4, -0.1, 0.2),
        ];
        tilts
            .iter()
            .enumerate()
            .map(|(k, &(rx, ry, rz))| {
                let rot = Rotation3::from_euler_angles(rx, ry, rz);
                // Keep the board centered in front of the camera.
                let center = Vector3::new(4.0 * 0.0226, 2.5 * 0.0226, 0.0);
                let offset = Vector3::new(
                    0.02 * (k as f64 - 3.5),
                    0.01 * ((k % 3) as f64 - 1.0),
                    0.33 + 0.02 * (k % 4) as f64,
                );
                let t = offset - rot * center;
                Isometry3::from_parts(Translation3::from(t), rot.into())
            })
            .collect()
    }

    pub fn views(camera: &CameraParams, dist: &Distortion) -> Vec<PlanarView> {
        let board = board(9, 6, 0.0226);
        poses()
            .iter()
            .map(|pose| {
                let image = board
                    .iter()
                    .map(|p| project_point(camera, dist, pose, p))
                    .collect();
                PlanarView::new(board.clone(), image)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn recovers_distortion_free_camera() {
        let truth = CameraParams::new(350.0, 352.0, 238.0, 121.0);
        let views = synthetic::views(&truth, &Distortion::default());
        let cal = calibrate_planar(&views, (480, 240), &SolverOptions::default()).expect("solve");
        assert_relative_eq!(cal.camera.fx, truth.fx, epsilon = 1e-3);
        assert_relative_eq!(cal.camera.fy, truth.fy, epsilon = 1e-3);
        assert_relative_eq!(cal.camera.cx, truth.cx, epsilon = 1e-3);
        assert_relative_eq!(cal.camera.cy, truth.cy, epsilon = 1e-3);
        assert!(cal.rms_error < 1e-4, "rms={}", cal.rms_error);
    }

    #[test]
    fn recovers_wide_angle_distortion() {
        let truth = CameraParams::new(300.0, 300.0, 242.0, 118.0);
        let dist = Distortion {
            k1: -0.25,
            k2: 0.06,
            p1: 0.001,
            p2: -0.0015,
            k3: 0.0,
        };
        let views = synthetic::views(&truth, &dist);
        let cal = calibrate_planar(&views, (480, 240), &SolverOptions::default()).expect("solve");
        assert_relative_eq!(cal.camera.fx, truth.fx, epsilon = 0.5);
        assert_relative_eq!(cal.camera.fy, truth.fy, epsilon = 0.5);
        assert_relative_eq!(cal.camera.cx, truth.cx, epsilon = 0.5);
        assert_relative_eq!(cal.camera.cy, truth.cy, epsilon = 0.5);
        assert_relative_eq!(cal.distortion.k1, dist.k1, epsilon = 0.01);
        assert!(cal.rms_error < 0.01, "rms={}", cal.rms_error);
        assert_eq!(cal.poses.len(), views.len());
    }

    #[test]
    fn poses_are_recovered_in_meters() {
        let truth = CameraParams::new(350.0, 350.0, 240.0, 120.0);
        let views = synthetic::views(&truth, &Distortion::default());
        let cal = calibrate_planar(&views, (480, 240), &SolverOptions::default()).expect("solve");
        for (est, gt) in cal.poses.iter().zip(synthetic::poses()) {
            assert_relative_eq!(
                est.translation.vector,
                gt.translation.vector,
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn rejects_too_few_views() {
        let truth = CameraParams::new(350.0, 350.0, 240.0, 120.0);
        let views = synthetic::views(&truth, &Distortion::default());
        let err = calibrate_planar(&views[..2], (480, 240), &SolverOptions::default()).unwrap_err();
        assert_eq!(err, SolverError::NotEnoughViews { got: 2, need: 3 });
    }

    #[test]
    fn rejects_mismatched_view() {
        let truth = CameraParams::new(350.0, 350.0, 240.0, 120.0);
        let mut views = synthetic::views(&truth, &Distortion::default());
        views[1].image_points.pop();
        let err = calibrate_planar(&views, (480, 240), &SolverOptions::default()).unwrap_err();
        assert!(matches!(err, SolverError::MismatchedView { view: 1, .. }));
    }
}
