use super::SolverError;
use nalgebra::{DMatrix, Matrix3, SVector};
use tagpose_core::CameraParams;

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> SVector<f64, 6> {
    let hi = h.column(i);
    let hj = h.column(j);
    SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Closed-form pinhole intrinsics from three or more plane homographies
/// (Zhang 2000), with skew forced to zero.
///
/// Pixel coordinates are first mapped to roughly `[-1, 1]` around the image
/// center so the entries of the conic `B = K^-T K^-1` have comparable
/// magnitudes.
pub fn intrinsics_from_homographies(
    hs: &[Matrix3<f64>],
    image_size: (usize, usize),
) -> Result<CameraParams, SolverError> {
    if hs.len() < super::MIN_VIEWS {
        return Err(SolverError::NotEnoughViews {
            got: hs.len(),
            need: super::MIN_VIEWS,
        });
    }
    let (w, h) = (image_size.0 as f64, image_size.1 as f64);
    let s = 2.0 / (w + h).max(1.0);
    let n = Matrix3::new(s, 0.0, -s * w * 0.5, 0.0, s, -s * h * 0.5, 0.0, 0.0, 1.0);

    let mut v = DMatrix::<f64>::zeros(2 * hs.len(), 6);
    for (k, hk) in hs.iter().enumerate() {
        let hn = n * hk;
        let hn = hn / hn.norm();
        let v11 = v_ij(&hn, 0, 0);
        let v22 = v_ij(&hn, 1, 1);
        let v12 = v_ij(&hn, 0, 1);
        v.row_mut(2 * k).copy_from(&v12.transpose());
        v.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
    }

    let svd = v.svd(false, true);
    let v_t = svd.v_t.ok_or(SolverError::DegenerateIntrinsics)?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .ok_or(SolverError::DegenerateIntrinsics)?;
    // The conic must be the only null direction.
    let mut sv: Vec<f64> = svd.singular_values.iter().copied().collect();
    sv.sort_by(|a, b| a.total_cmp(b));
    let largest = sv.last().copied().unwrap_or(0.0);
    if sv.len() < 6 || sv[1] <= 1e-9 * largest {
        return Err(SolverError::DegenerateIntrinsics);
    }
    let b = v_t.row(min_idx);
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    let denom_rel = denom.abs() / (b11 * b11 + b22 * b22).max(f64::MIN_POSITIVE);
    if denom_rel < 1e-9 {
        return Err(SolverError::DegenerateIntrinsics);
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    let alpha_sq = lambda / b11;
    let beta_sq = lambda * b11 / denom;
    if !(alpha_sq > 0.0 && beta_sq > 0.0) {
        return Err(SolverError::DegenerateIntrinsics);
    }
    let alpha = alpha_sq.sqrt();
    let beta = beta_sq.sqrt();
    let u0 = -b13 * alpha_sq / lambda;

    let k_norm = Matrix3::new(alpha, 0.0, u0, 0.0, beta, v0, 0.0, 0.0, 1.0);
    let n_inv = n.try_inverse().ok_or(SolverError::DegenerateIntrinsics)?;
    let camera = CameraParams::from_matrix(&(n_inv * k_norm));
    if !camera.is_valid() {
        return Err(SolverError::DegenerateIntrinsics);
    }
    Ok(camera)
}
