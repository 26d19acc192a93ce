use crate::DetectError;
use serde::{Deserialize, Serialize};

/// Inner-corner layout of the calibration board.
///
/// `cols` counts corners along a row, `rows` counts corners along a column,
/// so a 10x7-square board is `PatternSize { cols: 9, rows: 6 }`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternSize {
    pub cols: u32,
    pub rows: u32,
}

impl PatternSize {
    pub const fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }

    pub fn corner_count(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    pub fn validate(&self) -> Result<(), DetectError> {
        if self.cols < 2 || self.rows < 2 {
            return Err(DetectError::InvalidPattern {
                cols: self.cols,
                rows: self.rows,
            });
        }
        Ok(())
    }
}

impl Default for PatternSize {
    fn default() -> Self {
        Self::new(9, 6)
    }
}

/// Parameters of the multi-instance chessboard detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChessboardParams {
    pub pattern: PatternSize,

    /// Largest number of boards expected in one photograph.
    pub max_instances: usize,

    /// Multiplier on `max_instances` giving the hard bound on
    /// detect-then-mask passes.
    pub iteration_slack: usize,

    /// Gray level painted over a found board before the next pass.
    pub mask_value: u8,

    /// Mask outline growth beyond the outer inner corners, in grid spacings.
    pub mask_margin_rel: f64,

    /// ChESS relative response threshold (fraction of the image maximum).
    pub chess_threshold_rel: f32,

    /// ChESS non-maximum suppression radius in pixels.
    pub chess_nms_radius: u32,

    /// Accept a grid neighbor within this fraction of the local spacing
    /// from its predicted position.
    pub grid_tolerance_rel: f64,

    /// Corners closer than this are never treated as grid neighbors.
    pub min_spacing_pix: f64,
}

impl Default for ChessboardParams {
    fn default() -> Self {
        Self {
            pattern: PatternSize::default(),
            max_instances: 8,
            iteration_slack: 2,
            mask_value: 128,
            mask_margin_rel: 0.5,
            chess_threshold_rel: 0.2,
            chess_nms_radius: 2,
            grid_tolerance_rel: 0.3,
            min_spacing_pix: 6.0,
        }
    }
}

impl ChessboardParams {
    pub fn for_pattern(pattern: PatternSize) -> Self {
        Self {
            pattern,
            ..Self::default()
        }
    }

    /// Hard bound on detect-then-mask passes for one image.
    pub fn iteration_limit(&self) -> usize {
        self.max_instances
            .max(1)
            .saturating_mul(self.iteration_slack.max(1))
    }
}

/// Iterative gradient-based corner refinement settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubpixParams {
    /// Half side of the search window; the window spans `2 * half_window + 1` pixels.
    pub half_window: u32,
    /// Iteration cap per corner.
    pub max_iters: u32,
    /// Stop once a refinement step moves the corner less than this (pixels).
    pub epsilon: f64,
}

impl Default for SubpixParams {
    fn default() -> Self {
        Self {
            half_window: 11,
            max_iters: 30,
            epsilon: 0.001,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_limit_is_bounded_below() {
        let params = ChessboardParams {
            max_instances: 0,
            iteration_slack: 0,
            ..ChessboardParams::default()
        };
        assert_eq!(params.iteration_limit(), 1);
        assert_eq!(ChessboardParams::default().iteration_limit(), 16);
    }

    #[test]
    fn pattern_validation() {
        assert!(PatternSize::new(9, 6).validate().is_ok());
        assert_eq!(PatternSize::new(9, 6).corner_count(), 54);
        assert_eq!(
            PatternSize::new(1, 6).validate(),
            Err(DetectError::InvalidPattern { cols: 1, rows: 6 })
        );
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let params: ChessboardParams =
            serde_json::from_str(r#"{"pattern": {"cols": 7, "rows": 5}, "max_instances": 3}"#)
                .expect("parse");
        assert_eq!(params.pattern, PatternSize::new(7, 5));
        assert_eq!(params.max_instances, 3);
        assert_eq!(params.mask_value, 128);
    }
}
