//! `CheckerboardFinder` on top of the ChESS corner detector and the
//! `calib-targets` chessboard grid builder.

use crate::{BoardObservation, CheckerboardFinder, CheckerboardSpec};
use calib_targets::chessboard::ChessboardParams;
use calib_targets::detect;
use chess_corners::ChessConfig;
use nalgebra::Point2;
use std::collections::HashMap;
use tagpose_core::GrayImageView;

/// Chessboard finder that requires every inner corner to be labeled.
pub struct ChessCornerFinder {
    chess_cfg: ChessConfig,
    base_params: ChessboardParams,
}

impl ChessCornerFinder {
    pub fn new() -> Self {
        Self {
            chess_cfg: detect::default_chess_config(),
            base_params: ChessboardParams {
                completeness_threshold: 0.95,
                ..ChessboardParams::default()
            },
        }
    }

    /// Override the chessboard detector parameters. `expected_rows` and
    /// `expected_cols` are always taken from the board spec.
    pub fn with_params(mut self, params: ChessboardParams) -> Self {
        self.base_params = params;
        self
    }
}

impl Default for ChessCornerFinder {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckerboardFinder for ChessCornerFinder {
    fn find(
        &mut self,
        image: &GrayImageView<'_>,
        spec: &CheckerboardSpec,
    ) -> Option<BoardObservation> {
        let img = image::GrayImage::from_raw(
            u32::try_from(image.width).ok()?,
            u32::try_from(image.height).ok()?,
            image.data.to_vec(),
        )?;

        let params = ChessboardParams {
            expected_rows: Some(u32::try_from(spec.inner_rows).ok()?),
            expected_cols: Some(u32::try_from(spec.inner_cols).ok()?),
            ..self.base_params.clone()
        };
        let result = detect::detect_chessboard(&img, &self.chess_cfg, params)?;

        let labeled: Vec<(i32, i32, Point2<f64>)> = result
            .detection
            .corners
            .iter()
            .filter_map(|c| {
                let g = c.grid?;
                Some((
                    g.i,
                    g.j,
                    Point2::new(c.position.x as f64, c.position.y as f64),
                ))
            })
            .collect();
        order_grid(&labeled, spec)
    }
}

/// Arrange labeled corners row-major. The detector may report the grid
/// transposed relative to the board layout; both layouts are accepted.
fn order_grid(
    labeled: &[(i32, i32, Point2<f64>)],
    spec: &CheckerboardSpec,
) -> Option<BoardObservation> {
    if labeled.len() != spec.corner_count() {
        return None;
    }
    let min_i = labeled.iter().map(|c| c.0).min()?;
    let min_j = labeled.iter().map(|c| c.1).min()?;
    let span_i = (labeled.iter().map(|c| c.0).max()? - min_i + 1) as usize;
    let span_j = (labeled.iter().map(|c| c.1).max()? - min_j + 1) as usize;

    let transposed = match (span_i, span_j) {
        (c, r) if c == spec.inner_cols && r == spec.inner_rows => false,
        (r, c) if c == spec.inner_cols && r == spec.inner_rows => true,
        _ => return None,
    };

    let by_cell: HashMap<(usize, usize), Point2<f64>> = labeled
        .iter()
        .map(|&(i, j, p)| {
            let (a, b) = ((i - min_i) as usize, (j - min_j) as usize);
            let key = if transposed { (b, a) } else { (a, b) };
            (key, p)
        })
        .collect();

    let mut corners = Vec::with_capacity(spec.corner_count());
    for j in 0..spec.inner_rows {
        for i in 0..spec.inner_cols {
            corners.push(*by_cell.get(&(i, j))?);
        }
    }
    Some(BoardObservation { corners })
}
