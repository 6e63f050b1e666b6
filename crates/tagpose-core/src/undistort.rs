//! Lens-distortion correction.
//!
//! `optimal_new_camera_matrix` picks the output intrinsics so that the
//! undistorted image keeps either all source pixels (`alpha = 1`) or only
//! valid ones (`alpha = 0`). `Undistorter` bakes the per-pixel remap once
//! per session and applies it to every captured frame.

use crate::{CalibrationParameters, CameraModelError, CameraParams, ColorFrame, Distortion};
use nalgebra::Matrix3;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Number of samples per image side used to trace the undistorted border.
const BORDER_SAMPLES: usize = 9;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum UndistortError {
    #[error(transparent)]
    Camera(#[from] CameraModelError),
    #[error("image size must be non-zero (width={width}, height={height})")]
    EmptyImage { width: usize, height: usize },
    #[error("alpha must lie in [0, 1], got {0}")]
    InvalidAlpha(f64),
    #[error("undistorted border is degenerate; distortion coefficients are likely wrong")]
    DegenerateBorder,
    #[error("frame is {got_w}x{got_h} but the undistortion map was built for {want_w}x{want_h}")]
    FrameSize {
        got_w: usize,
        got_h: usize,
        want_w: usize,
        want_h: usize,
    },
}

#[derive(Clone, Copy, Debug)]
struct Rect {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

impl Rect {
    fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    fn is_usable(&self) -> bool {
        [self.x0, self.y0, self.x1, self.y1]
            .iter()
            .all(|v| v.is_finite())
            && self.width() > 1e-12
            && self.height() > 1e-12
    }
}

/// Undistort a grid of border/interior samples and return the largest
/// rectangle inside the valid region and the smallest one containing it,
/// both in normalized coordinates.
fn border_rectangles(
    camera: &CameraParams,
    distortion: &Distortion,
    width: usize,
    height: usize,
) -> (Rect, Rect) {
    let n = BORDER_SAMPLES;
    let mut inner = Rect {
        x0: f64::MIN,
        y0: f64::MIN,
        x1: f64::MAX,
        y1: f64::MAX,
    };
    let mut outer = Rect {
        x0: f64::MAX,
        y0: f64::MAX,
        x1: f64::MIN,
        y1: f64::MIN,
    };

    for row in 0..n {
        for col in 0..n {
            let u = col as f64 * (width as f64 - 1.0) / (n - 1) as f64;
            let v = row as f64 * (height as f64 - 1.0) / (n - 1) as f64;
            let [x, y] = distortion.undistort_normalized(camera.pixel_to_normalized([u, v]));

            outer.x0 = outer.x0.min(x);
            outer.x1 = outer.x1.max(x);
            outer.y0 = outer.y0.min(y);
            outer.y1 = outer.y1.max(y);

            if col == 0 {
                inner.x0 = inner.x0.max(x);
            }
            if col == n - 1 {
                inner.x1 = inner.x1.min(x);
            }
            if row == 0 {
                inner.y0 = inner.y0.max(y);
            }
            if row == n - 1 {
                inner.y1 = inner.y1.min(y);
            }
        }
    }
    (inner, outer)
}

/// Compute the intrinsics of the undistorted output image.
///
/// `alpha = 0` crops to valid pixels only, `alpha = 1` keeps every source
/// pixel visible (black borders appear). The output image has the same size
/// as the input.
pub fn optimal_new_camera_matrix(
    camera: &CameraParams,
    distortion: &Distortion,
    image_size: (usize, usize),
    alpha: f64,
) -> Result<Matrix3<f64>, UndistortError> {
    let (width, height) = image_size;
    if width == 0 || height == 0 {
        return Err(UndistortError::EmptyImage { width, height });
    }
    if !(0.0..=1.0).contains(&alpha) {
        return Err(UndistortError::InvalidAlpha(alpha));
    }
    if !camera.is_valid() {
        return Err(CameraModelError::InvalidFocalLength {
            fx: camera.fx,
            fy: camera.fy,
        }
        .into());
    }

    let (inner, outer) = border_rectangles(camera, distortion, width, height);
    if !inner.is_usable() || !outer.is_usable() {
        return Err(UndistortError::DegenerateBorder);
    }

    let span_x = width as f64 - 1.0;
    let span_y = height as f64 - 1.0;
    // Single-pixel images have no extent; keep the source focal length there.
    let focal = |span: f64, extent: f64, fallback: f64| {
        if span > 0.0 {
            span / extent
        } else {
            fallback
        }
    };

    let fx0 = focal(span_x, inner.width(), camera.fx);
    let fy0 = focal(span_y, inner.height(), camera.fy);
    let cx0 = -fx0 * inner.x0;
    let cy0 = -fy0 * inner.y0;

    let fx1 = focal(span_x, outer.width(), camera.fx);
    let fy1 = focal(span_y, outer.height(), camera.fy);
    let cx1 = -fx1 * outer.x0;
    let cy1 = -fy1 * outer.y0;

    let lerp = |a: f64, b: f64| a * (1.0 - alpha) + b * alpha;
    Ok(Matrix3::new(
        lerp(fx0, fx1),
        0.0,
        lerp(cx0, cx1),
        0.0,
        lerp(fy0, fy1),
        lerp(cy0, cy1),
        0.0,
        0.0,
        1.0,
    ))
}

/// Precomputed undistortion remap for one camera at one resolution.
#[derive(Clone, Debug)]
pub struct Undistorter {
    camera: CameraParams,
    skew: f64,
    distortion: Distortion,
    new_camera_matrix: Matrix3<f64>,
    width: usize,
    height: usize,
    /// For each output pixel, the source pixel to sample.
    map: Vec<[f32; 2]>,
}

impl Undistorter {
    /// Build the optimal new camera matrix and the remap table.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(params), fields(width = image_size.0, height = image_size.1))
    )]
    pub fn new(
        params: &CalibrationParameters,
        image_size: (usize, usize),
        alpha: f64,
    ) -> Result<Self, UndistortError> {
        params.validate()?;
        let camera = params.camera_params();
        let distortion = params.distortion_model()?;
        let new_camera_matrix =
            optimal_new_camera_matrix(&camera, &distortion, image_size, alpha)?;
        let (width, height) = image_size;

        let out = CameraParams::from_matrix(&new_camera_matrix);
        let skew = params.camera_matrix[0][1];
        let mut map = Vec::with_capacity(width * height);
        for v in 0..height {
            for u in 0..width {
                let [xd, yd] =
                    distortion.distort_normalized(out.pixel_to_normalized([u as f64, v as f64]));
                let src_u = camera.fx * xd + skew * yd + camera.cx;
                let src_v = camera.fy * yd + camera.cy;
                map.push([src_u as f32, src_v as f32]);
            }
        }

        log::debug!(
            "undistortion map ready: {}x{}, new fx={:.2} fy={:.2} cx={:.2} cy={:.2}",
            width,
            height,
            out.fx,
            out.fy,
            out.cx,
            out.cy
        );

        Ok(Self {
            camera,
            skew,
            distortion,
            new_camera_matrix,
            width,
            height,
            map,
        })
    }

    /// Intrinsics of the undistorted output.
    #[inline]
    pub fn new_camera_matrix(&self) -> &Matrix3<f64> {
        &self.new_camera_matrix
    }

    /// Intrinsics of the raw (distorted) input.
    #[inline]
    pub fn source_camera(&self) -> &CameraParams {
        &self.camera
    }

    #[inline]
    pub fn distortion(&self) -> &Distortion {
        &self.distortion
    }

    #[inline]
    pub fn image_size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Map an output pixel back to the raw frame.
    pub fn source_pixel(&self, u: usize, v: usize) -> Option<[f32; 2]> {
        (u < self.width && v < self.height).then(|| self.map[v * self.width + u])
    }

    /// Map a raw (distorted) pixel into the undistorted output frame.
    pub fn undistort_pixel(&self, pixel: [f64; 2]) -> [f64; 2] {
        let yd = (pixel[1] - self.camera.cy) / self.camera.fy;
        let xd = (pixel[0] - self.camera.cx - self.skew * yd) / self.camera.fx;
        let n = self.distortion.undistort_normalized([xd, yd]);
        CameraParams::from_matrix(&self.new_camera_matrix).normalized_to_pixel(n)
    }

    /// Remove lens distortion from a frame.
    pub fn apply(&self, frame: &ColorFrame) -> Result<ColorFrame, UndistortError> {
        if frame.width != self.width || frame.height != self.height {
            return Err(UndistortError::FrameSize {
                got_w: frame.width,
                got_h: frame.height,
                want_w: self.width,
                want_h: self.height,
            });
        }
        let mut out = ColorFrame::new(self.width, self.height);
        for (idx, [sx, sy]) in self.map.iter().enumerate() {
            let rgb = frame.sample_bilinear(*sx, *sy);
            out.data[idx * 3..idx * 3 + 3].copy_from_slice(&rgb);
        }
        Ok(out)
    }
}
