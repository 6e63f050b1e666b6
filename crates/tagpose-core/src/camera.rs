//! Pinhole intrinsics, Brown-Conrady distortion and the persisted
//! calibration record.

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

/// Errors raised when a calibration record does not describe a usable camera.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraModelError {
    #[error("camera matrix contains non-finite values")]
    NonFiniteMatrix,
    #[error("camera matrix has a zero or negative focal length (fx={fx}, fy={fy})")]
    InvalidFocalLength { fx: f64, fy: f64 },
    #[error("camera matrix last row must be [0, 0, 1], got {row:?}")]
    InvalidLastRow { row: [f64; 3] },
    #[error("expected 4 or 5 distortion coefficients (or more trailing zeros), got {len}")]
    UnsupportedDistortion { len: usize },
    #[error("distortion coefficients contain non-finite values")]
    NonFiniteDistortion,
}

/// Flattened pinhole intrinsics `(fx, fy, cx, cy)` as consumed by tag pose
/// estimation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraParams {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraParams {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Read `m[0][0], m[1][1], m[0][2], m[1][2]`. Skew is dropped.
    pub fn from_matrix(m: &Matrix3<f64>) -> Self {
        Self {
            fx: m[(0, 0)],
            fy: m[(1, 1)],
            cx: m[(0, 2)],
            cy: m[(1, 2)],
        }
    }

    pub fn to_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.fx, self.fy, self.cx, self.cy]
    }

    pub fn is_valid(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite()) && self.fx > 0.0 && self.fy > 0.0
    }

    #[inline]
    pub fn pixel_to_normalized(&self, pixel: [f64; 2]) -> [f64; 2] {
        [(pixel[0] - self.cx) / self.fx, (pixel[1] - self.cy) / self.fy]
    }

    #[inline]
    pub fn normalized_to_pixel(&self, normalized: [f64; 2]) -> [f64; 2] {
        [
            self.fx * normalized[0] + self.cx,
            self.fy * normalized[1] + self.cy,
        ]
    }
}

/// Brown-Conrady radial-tangential distortion coefficients.
///
/// Serialized and exchanged in OpenCV order: `k1, k2, p1, p2, k3`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

const UNDISTORT_MAX_ITERS: usize = 20;
const UNDISTORT_EPS: f64 = 1e-12;

impl Distortion {
    /// Build from an OpenCV-ordered coefficient vector.
    ///
    /// Accepts 4 or 5 coefficients; longer vectors are accepted only when the
    /// extra (rational / thin-prism) terms are all zero.
    pub fn from_coefficients(coeffs: &[f64]) -> Result<Self, CameraModelError> {
        if coeffs.iter().any(|c| !c.is_finite()) {
            return Err(CameraModelError::NonFiniteDistortion);
        }
        let len = coeffs.len();
        if len < 4 || (len > 5 && coeffs[5..].iter().any(|c| *c != 0.0)) {
            return Err(CameraModelError::UnsupportedDistortion { len });
        }
        Ok(Self {
            k1: coeffs[0],
            k2: coeffs[1],
            p1: coeffs[2],
            p2: coeffs[3],
            k3: coeffs.get(4).copied().unwrap_or(0.0),
        })
    }

    pub fn to_coefficients(&self) -> Vec<f64> {
        vec![self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_zero(&self) -> bool {
        self.to_coefficients().iter().all(|c| *c == 0.0)
    }

    /// Apply distortion to normalized (undistorted) coordinates.
    #[inline]
    pub fn distort_normalized(&self, p: [f64; 2]) -> [f64; 2] {
        let [x, y] = p;
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        let x_tan = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let y_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        [x * radial + x_tan, y * radial + y_tan]
    }

    /// Invert [`Self::distort_normalized`] by fixed-point iteration.
    pub fn undistort_normalized(&self, distorted: [f64; 2]) -> [f64; 2] {
        if self.is_zero() {
            return distorted;
        }
        let [xd, yd] = distorted;
        let mut x = xd;
        let mut y = yd;
        for _ in 0..UNDISTORT_MAX_ITERS {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
            if radial.abs() < 1e-12 || !radial.is_finite() {
                break;
            }
            let x_tan = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let y_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            let x_next = (xd - x_tan) / radial;
            let y_next = (yd - y_tan) / radial;
            let delta = (x_next - x).hypot(y_next - y);
            x = x_next;
            y = y_next;
            if delta < UNDISTORT_EPS {
                break;
            }
        }
        [x, y]
    }
}

/// Persisted calibration record: intrinsic matrix plus distortion vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    /// Row-major 3x3 intrinsic matrix.
    pub camera_matrix: [[f64; 3]; 3],
    /// Distortion coefficients in OpenCV order (`k1, k2, p1, p2[, k3]`).
    pub distortion: Vec<f64>,
    /// Image size `[width, height]` the calibration was computed at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<[u32; 2]>,
    /// RMS reprojection error of the solve, in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rms_error: Option<f64>,
    /// Number of board views the solve used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub views: Option<usize>,
}

impl CalibrationParameters {
    pub fn new(camera_matrix: Matrix3<f64>, distortion: Distortion) -> Self {
        let m = &camera_matrix;
        Self {
            camera_matrix: [
                [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
                [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
                [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
            ],
            distortion: distortion.to_coefficients(),
            image_size: None,
            rms_error: None,
            views: None,
        }
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        let r = &self.camera_matrix;
        Matrix3::new(
            r[0][0], r[0][1], r[0][2], //
            r[1][0], r[1][1], r[1][2], //
            r[2][0], r[2][1], r[2][2],
        )
    }

    pub fn camera_params(&self) -> CameraParams {
        CameraParams::from_matrix(&self.matrix())
    }

    pub fn distortion_model(&self) -> Result<Distortion, CameraModelError> {
        Distortion::from_coefficients(&self.distortion)
    }

    /// Check that the record describes a usable pinhole camera.
    pub fn validate(&self) -> Result<(), CameraModelError> {
        let m = &self.camera_matrix;
        if m.iter().flatten().any(|v| !v.is_finite()) {
            return Err(CameraModelError::NonFiniteMatrix);
        }
        if m[2] != [0.0, 0.0, 1.0] {
            return Err(CameraModelError::InvalidLastRow { row: m[2] });
        }
        let (fx, fy) = (m[0][0], m[1][1]);
        if fx <= 0.0 || fy <= 0.0 {
            return Err(CameraModelError::InvalidFocalLength { fx, fy });
        }
        self.distortion_model().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn reference_record() -> CalibrationParameters {
        CalibrationParameters {
            camera_matrix: [[350.0, 0.0, 240.0], [0.0, 350.0, 120.0], [0.0, 0.0, 1.0]],
            distortion: vec![0.0; 5],
            image_size: None,
            rms_error: None,
            views: None,
        }
    }

    #[test]
    fn camera_params_flatten_matrix() {
        let params = reference_record().camera_params();
        assert_eq!(params.as_array(), [350.0, 350.0, 240.0, 120.0]);
    }

    #[test]
    fn matrix_round_trips_through_record() {
        let k = Matrix3::new(812.5, 0.25, 321.0, 0.0, 809.0, 238.5, 0.0, 0.0, 1.0);
        let record = CalibrationParameters::new(k, Distortion::default());
        assert_eq!(record.matrix(), k);
        assert_eq!(record.camera_params(), CameraParams::from_matrix(&k));
    }

    #[test]
    fn validate_rejects_bad_matrices() {
        let mut rec = reference_record();
        rec.camera_matrix[0][0] = 0.0;
        assert!(matches!(
            rec.validate(),
            Err(CameraModelError::InvalidFocalLength { .. })
        ));

        let mut rec = reference_record();
        rec.camera_matrix[2] = [0.0, 0.0, 2.0];
        assert!(matches!(
            rec.validate(),
            Err(CameraModelError::InvalidLastRow { .. })
        ));

        let mut rec = reference_record();
        rec.distortion = vec![0.1, 0.0];
        assert!(matches!(
            rec.validate(),
            Err(CameraModelError::UnsupportedDistortion { len: 2 })
        ));

        assert!(reference_record().validate().is_ok());
    }

    #[test]
    fn distortion_accepts_trailing_zero_terms() {
        let d = Distortion::from_coefficients(&[0.1, -0.2, 0.001, 0.002, 0.05, 0.0, 0.0, 0.0])
            .expect("eight coefficients with zero tail");
        assert_eq!(d.k3, 0.05);
        assert!(Distortion::from_coefficients(&[0.1, -0.2, 0.0, 0.0, 0.0, 0.3]).is_err());
    }

    #[test]
    fn undistort_inverts_distort() {
        let d = Distortion {
            k1: -0.28,
            k2: 0.09,
            p1: 0.0012,
            p2: -0.0008,
            k3: 0.0,
        };
        for p in [[0.0, 0.0], [0.2, -0.1], [-0.35, 0.25], [0.4, 0.3]] {
            let back = d.undistort_normalized(d.distort_normalized(p));
            assert_relative_eq!(back[0], p[0], epsilon = 1e-9);
            assert_relative_eq!(back[1], p[1], epsilon = 1e-9);
        }
    }

    #[test]
    fn record_serializes_without_empty_metadata() {
        let json = serde_json::to_string(&reference_record()).expect("serialize");
        assert!(!json.contains("rms_error"));
        let back: CalibrationParameters = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, reference_record());
    }
}
