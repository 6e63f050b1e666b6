use nalgebra::{DMatrix, Matrix3, Point2};

/// Similarity that moves the centroid to the origin and scales the mean
/// distance to `sqrt(2)` (Hartley normalization).
fn normalization(points: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (sx / n, sy / n);
    let mean_dist = points
        .iter()
        .map(|p| (p.x - cx).hypot(p.y - cy))
        .sum::<f64>()
        / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(
        s,
        0.0,
        -s * cx,
        0.0,
        s,
        -s * cy,
        0.0,
        0.0,
        1.0,
    ))
}

fn apply(t: &Matrix3<f64>, p: &Point2<f64>) -> (f64, f64) {
    (
        t[(0, 0)] * p.x + t[(0, 2)],
        t[(1, 1)] * p.y + t[(1, 2)],
    )
}

/// Homography `H` with `image ~ H * [board, 1]`, normalized to `H[2,2] = 1`.
///
/// Normalized DLT. Returns `None` for fewer than 4 correspondences or a
/// degenerate (e.g. collinear) configuration.
pub fn estimate_homography(
    board: &[Point2<f64>],
    image: &[Point2<f64>],
) -> Option<Matrix3<f64>> {
    if board.len() != image.len() || board.len() < 4 {
        return None;
    }
    let t_board = normalization(board)?;
    let t_image = normalization(image)?;

    // A 4-point problem has 8 equations; pad so SVD exposes the 9th singular
    // vector.
    let n = board.len();
    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (k, (b, m)) in board.iter().zip(image).enumerate() {
        let (x, y) = apply(&t_board, b);
        let (u, v) = apply(&t_image, m);
        let r = 2 * k;
        a[(r, 0)] = -x;
        a[(r, 1)] = -y;
        a[(r, 2)] = -1.0;
        a[(r, 6)] = u * x;
        a[(r, 7)] = u * y;
        a[(r, 8)] = u;

        a[(r + 1, 3)] = -x;
        a[(r + 1, 4)] = -y;
        a[(r + 1, 5)] = -1.0;
        a[(r + 1, 6)] = v * x;
        a[(r + 1, 7)] = v * y;
        a[(r + 1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = v_t.row(min_idx);
    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let h_full = t_image.try_inverse()? * h_norm * t_board;
    let scale = h_full[(2, 2)];
    if scale.abs() < 1e-12 || !scale.is_finite() {
        return None;
    }
    let h_full = h_full / scale;
    if h_full.iter().any(|v| !v.is_finite()) || h_full.determinant().abs() < 1e-15 {
        return None;
    }
    Some(h_full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn map(h: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
        let v = h * nalgebra::Vector3::new(p.x, p.y, 1.0);
        Point2::new(v.x / v.z, v.y / v.z)
    }

    #[test]
    fn recovers_projective_map() {
        let h_true = Matrix3::new(
            950.0, 30.0, 120.0, //
            -20.0, 910.0, 80.0, //
            0.4, -0.3, 1.0,
        );
        let board: Vec<Point2<f64>> = (0..5)
            .flat_map(|j| (0..4).map(move |i| Point2::new(0.03 * i as f64, 0.03 * j as f64)))
            .collect();
        let image: Vec<Point2<f64>> = board.iter().map(|p| map(&h_true, p)).collect();

        let h = estimate_homography(&board, &image).expect("homography");
        assert_relative_eq!(h, h_true, epsilon = 1e-6, max_relative = 1e-8);
    }

    #[test]
    fn four_points_are_enough() {
        let board = [
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 1.0),
        ];
        let image = [
            Point2::new(10.0, 12.0),
            Point2::new(110.0, 15.0),
            Point2::new(105.0, 118.0),
            Point2::new(8.0, 109.0),
        ];
        let h = estimate_homography(&board, &image).expect("homography");
        for (b, m) in board.iter().zip(&image) {
            let p = map(&h, b);
            assert_relative_eq!(p.x, m.x, epsilon = 1e-8);
            assert_relative_eq!(p.y, m.y, epsilon = 1e-8);
        }
    }

    #[test]
    fn degenerate_input_is_rejected() {
        let board: Vec<Point2<f64>> = (0..6).map(|i| Point2::new(i as f64, 0.0)).collect();
        let image = vec![Point2::new(3.0, 1.0); 6];
        assert!(estimate_homography(&board, &image).is_none());
        assert!(estimate_homography(&board[..3], &image[..3]).is_none());
    }
}
