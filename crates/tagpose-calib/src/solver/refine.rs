//! Levenberg-Marquardt refinement of intrinsics, distortion and board poses
//! on the reprojection error, solved with `levenberg-marquardt`.

use super::{PlanarView, SolverError, SolverOptions};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn, Isometry3, Point2, Point3, Vector3};
use tagpose_core::{CameraParams, Distortion};

const CAMERA_PARAMS: usize = 9;
const POSE_PARAMS: usize = 6;

/// Project a board-plane point through `pose` and the distorted pinhole.
pub fn project_point(
    camera: &CameraParams,
    dist: &Distortion,
    pose: &Isometry3<f64>,
    board: &Point2<f64>,
) -> Point2<f64> {
    let pc = pose * Point3::new(board.x, board.y, 0.0);
    let d = dist.distort_normalized([pc.x / pc.z, pc.y / pc.z]);
    let [u, v] = camera.normalized_to_pixel(d);
    Point2::new(u, v)
}

pub(super) fn view_rms(
    view: &PlanarView,
    camera: &CameraParams,
    dist: &Distortion,
    pose: &Isometry3<f64>,
) -> f64 {
    let sum_sq: f64 = view
        .board_points
        .iter()
        .zip(&view.image_points)
        .map(|(b, m)| (project_point(camera, dist, pose, b) - m).norm_squared())
        .sum();
    (sum_sq / view.board_points.len().max(1) as f64).sqrt()
}

/// Flat parameter vector: `fx fy cx cy k1 k2 p1 p2 k3`, then per view the
/// rotation vector and translation.
struct Layout {
    offsets: Vec<usize>,
    rows: usize,
}

impl Layout {
    fn new(views: &[PlanarView]) -> Self {
        let mut offsets = Vec::with_capacity(views.len());
        let mut rows = 0;
        for v in views {
            offsets.push(rows);
            rows += 2 * v.board_points.len();
        }
        Self { offsets, rows }
    }

    fn pose_start(view: usize) -> usize {
        CAMERA_PARAMS + POSE_PARAMS * view
    }
}

fn pack(camera: &CameraParams, dist: &Distortion, poses: &[Isometry3<f64>]) -> DVector<f64> {
    let mut p = DVector::zeros(CAMERA_PARAMS + POSE_PARAMS * poses.len());
    let head = [
        camera.fx, camera.fy, camera.cx, camera.cy, dist.k1, dist.k2, dist.p1, dist.p2, dist.k3,
    ];
    for (i, v) in head.iter().enumerate() {
        p[i] = *v;
    }
    for (k, pose) in poses.iter().enumerate() {
        let r = pose.rotation.scaled_axis();
        let t = pose.translation.vector;
        let s = Layout::pose_start(k);
        for i in 0..3 {
            p[s + i] = r[i];
            p[s + 3 + i] = t[i];
        }
    }
    p
}

fn unpack_camera(p: &DVector<f64>) -> (CameraParams, Distortion) {
    (
        CameraParams::new(p[0], p[1], p[2], p[3]),
        Distortion {
            k1: p[4],
            k2: p[5],
            p1: p[6],
            p2: p[7],
            k3: p[8],
        },
    )
}

fn unpack_pose(p: &DVector<f64>, view: usize) -> Isometry3<f64> {
    let s = Layout::pose_start(view);
    Isometry3::new(
        Vector3::new(p[s + 3], p[s + 4], p[s + 5]),
        Vector3::new(p[s], p[s + 1], p[s + 2]),
    )
}

fn view_residuals(view: &PlanarView, p: &DVector<f64>, idx: usize, out: &mut [f64]) {
    let (camera, dist) = unpack_camera(p);
    let pose = unpack_pose(p, idx);
    for (k, (b, m)) in view.board_points.iter().zip(&view.image_points).enumerate() {
        let proj = project_point(&camera, &dist, &pose, b);
        out[2 * k] = proj.x - m.x;
        out[2 * k + 1] = proj.y - m.y;
    }
}

fn residuals(views: &[PlanarView], layout: &Layout, p: &DVector<f64>) -> DVector<f64> {
    let mut r = DVector::zeros(layout.rows);
    for (idx, view) in views.iter().enumerate() {
        let start = layout.offsets[idx];
        let len = 2 * view.board_points.len();
        view_residuals(view, p, idx, &mut r.as_mut_slice()[start..start + len]);
    }
    r
}

fn step_size(value: f64) -> f64 {
    1e-6 * (1.0 + value.abs())
}

/// Central-difference Jacobian over the free parameters. Pose columns only
/// touch the rows of their own view.
fn jacobian(
    views: &[PlanarView],
    layout: &Layout,
    p: &DVector<f64>,
    free: &[usize],
) -> DMatrix<f64> {
    let mut j = DMatrix::zeros(layout.rows, free.len());
    let mut shifted = p.clone();
    for (col, &param) in free.iter().enumerate() {
        let h = step_size(p[param]);
        let view_only = param
            .checked_sub(CAMERA_PARAMS)
            .map(|rel| rel / POSE_PARAMS);

        let eval = |shifted: &DVector<f64>| -> DVector<f64> {
            match view_only {
                Some(idx) => {
                    let mut r = DVector::zeros(2 * views[idx].board_points.len());
                    view_residuals(&views[idx], shifted, idx, r.as_mut_slice());
                    r
                }
                None => residuals(views, layout, shifted),
            }
        };

        shifted[param] = p[param] + h;
        let plus = eval(&shifted);
        shifted[param] = p[param] - h;
        let minus = eval(&shifted);
        shifted[param] = p[param];

        let d = (plus - minus) / (2.0 * h);
        let start = view_only.map_or(0, |idx| layout.offsets[idx]);
        j.view_mut((start, col), (d.len(), 1)).copy_from(&d);
    }
    j
}

fn free_parameters(n_views: usize, opts: &SolverOptions) -> Vec<usize> {
    let mut free: Vec<usize> = vec![0, 1, 2, 3, 4, 5];
    if !opts.fix_tangential {
        free.extend([6, 7]);
    }
    if !opts.fix_k3 {
        free.push(8);
    }
    free.extend(CAMERA_PARAMS..CAMERA_PARAMS + POSE_PARAMS * n_views);
    free
}

/// Reprojection error over the free parameters. The fixed ones stay at
/// their value in `full`.
struct Reprojection<'a> {
    views: &'a [PlanarView],
    layout: Layout,
    free: Vec<usize>,
    full: DVector<f64>,
}

impl Reprojection<'_> {
    fn free_values(&self) -> DVector<f64> {
        DVector::from_iterator(self.free.len(), self.free.iter().map(|&i| self.full[i]))
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for Reprojection<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        for (k, &param) in self.free.iter().enumerate() {
            self.full[param] = x[k];
        }
    }

    fn params(&self) -> DVector<f64> {
        self.free_values()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let r = residuals(self.views, &self.layout, &self.full);
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let j = jacobian(self.views, &self.layout, &self.full, &self.free);
        j.iter().all(|v| v.is_finite()).then_some(j)
    }
}

pub(super) fn refine(
    views: &[PlanarView],
    camera: CameraParams,
    dist: Distortion,
    poses: Vec<Isometry3<f64>>,
    opts: &SolverOptions,
) -> Result<(CameraParams, Distortion, Vec<Isometry3<f64>>), SolverError> {
    let problem = Reprojection {
        views,
        layout: Layout::new(views),
        free: free_parameters(views.len(), opts),
        full: pack(&camera, &dist, &poses),
    };
    let initial_cost = problem
        .residuals()
        .ok_or(SolverError::NonFinite)?
        .norm_squared();
    if opts.max_refine_iterations == 0 {
        return Ok((camera, dist, poses));
    }

    let lm = LevenbergMarquardt::new()
        .with_ftol(opts.refine_tolerance)
        .with_xtol(opts.refine_tolerance)
        .with_patience(opts.max_refine_iterations);
    let (problem, report) = lm.minimize(problem);

    let cost = 2.0 * report.objective_function;
    if !cost.is_finite() {
        return Err(SolverError::NonFinite);
    }
    if !report.termination.was_successful() {
        log::debug!("lm ended without convergence: {:?}", report.termination);
    }
    log::debug!(
        "lm refinement: cost {:.3e} -> {:.3e} over {} residuals, {} evaluations",
        initial_cost,
        cost,
        problem.layout.rows,
        report.number_of_evaluations
    );

    let (camera, dist) = unpack_camera(&problem.full);
    let poses = (0..views.len())
        .map(|k| unpack_pose(&problem.full, k))
        .collect();
    Ok((camera, dist, poses))
}

#[cfg(test)]
mod tests {
    use super::super::synthetic;
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Translation3;

    #[test]
    fn pack_round_trips_poses() {
        let camera = CameraParams::new(350.0, 350.0, 240.0, 120.0);
        let poses = synthetic::poses();
        let p = pack(&camera, &Distortion::default(), &poses);
        for (k, pose) in poses.iter().enumerate() {
            let back = unpack_pose(&p, k);
            assert_relative_eq!(back.translation.vector, pose.translation.vector, epsilon = 1e-12);
            assert_relative_eq!(back.rotation.angle_to(&pose.rotation), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn refinement_pulls_perturbed_start_to_truth() {
        let truth = CameraParams::new(350.0, 350.0, 240.0, 120.0);
        let dist = Distortion {
            k1: -0.1,
            ..Distortion::default()
        };
        let views = synthetic::views(&truth, &dist);
        let start_poses: Vec<Isometry3<f64>> = synthetic::poses()
            .into_iter()
            .map(|p| Translation3::new(0.002, -0.001, 0.005) * p)
            .collect();
        let start = CameraParams::new(340.0, 362.0, 236.0, 125.0);

        let (cam, d, _) = refine(
            &views,
            start,
            Distortion::default(),
            start_poses,
            &SolverOptions::default(),
        )
        .expect("refine");
        assert_relative_eq!(cam.fx, truth.fx, epsilon = 1e-4);
        assert_relative_eq!(cam.cy, truth.cy, epsilon = 1e-4);
        assert_relative_eq!(d.k1, dist.k1, epsilon = 1e-6);
    }

    #[test]
    fn zero_iterations_keep_the_linear_estimate() {
        let camera = CameraParams::new(340.0, 362.0, 236.0, 125.0);
        let views = synthetic::views(&camera, &Distortion::default());
        let opts = SolverOptions {
            max_refine_iterations: 0,
            ..SolverOptions::default()
        };
        let (cam, d, poses) =
            refine(&views, camera, Distortion::default(), synthetic::poses(), &opts)
                .expect("refine");
        assert_eq!(cam, camera);
        assert_eq!(d, Distortion::default());
        assert_eq!(poses, synthetic::poses());
    }

    #[test]
    fn board_through_the_camera_center_is_non_finite() {
        let camera = CameraParams::new(350.0, 350.0, 240.0, 120.0);
        let views = synthetic::views(&camera, &Distortion::default());
        let poses = vec![Isometry3::identity(); views.len()];
        let err = refine(
            &views,
            camera,
            Distortion::default(),
            poses,
            &SolverOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, SolverError::NonFinite);
    }
}
