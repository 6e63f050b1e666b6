use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use tagpose_core::GrayImageView;

/// Printed checkerboard geometry.
///
/// `inner_cols` x `inner_rows` counts the corners where four squares meet,
/// so the standard OpenCV `pattern.png` (10 x 7 squares) is 9 x 6.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckerboardSpec {
    pub inner_cols: usize,
    pub inner_rows: usize,
    /// Square edge length in meters. Sets the metric unit of every pose
    /// derived from this calibration.
    pub square_size: f64,
}

impl CheckerboardSpec {
    pub fn new(inner_cols: usize, inner_rows: usize, square_size: f64) -> Self {
        Self {
            inner_cols,
            inner_rows,
            square_size,
        }
    }

    pub fn corner_count(&self) -> usize {
        self.inner_cols * self.inner_rows
    }

    /// Board-plane coordinates of every inner corner, row-major
    /// (`index = j * inner_cols + i`), at `(i * square, j * square)`.
    pub fn board_points(&self) -> Vec<Point2<f64>> {
        (0..self.inner_rows)
            .flat_map(|j| {
                (0..self.inner_cols).map(move |i| {
                    Point2::new(i as f64 * self.square_size, j as f64 * self.square_size)
                })
            })
            .collect()
    }
}

/// Pixel positions of every inner corner in one frame, in the same
/// row-major order as [`CheckerboardSpec::board_points`].
#[derive(Clone, Debug, PartialEq)]
pub struct BoardObservation {
    pub corners: Vec<Point2<f64>>,
}

/// Finds a complete checkerboard in a gray frame.
///
/// Implementations return `None` unless *every* inner corner was located and
/// labeled; partial boards are useless to the planar solver.
pub trait CheckerboardFinder {
    fn find(&mut self, image: &GrayImageView<'_>, spec: &CheckerboardSpec)
        -> Option<BoardObservation>;
}

impl<F: CheckerboardFinder + ?Sized> CheckerboardFinder for Box<F> {
    fn find(
        &mut self,
        image: &GrayImageView<'_>,
        spec: &CheckerboardSpec,
    ) -> Option<BoardObservation> {
        (**self).find(image, spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_points_are_row_major() {
        let spec = CheckerboardSpec::new(3, 2, 0.5);
        let pts = spec.board_points();
        assert_eq!(pts.len(), spec.corner_count());
        assert_eq!(pts[0], Point2::new(0.0, 0.0));
        assert_eq!(pts[2], Point2::new(1.0, 0.0));
        assert_eq!(pts[3], Point2::new(0.0, 0.5));
    }
}
