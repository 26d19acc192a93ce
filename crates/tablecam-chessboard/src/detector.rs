use chess_corners::{find_chess_corners_image, ChessConfig, ThresholdMode};
use image::GrayImage;
use log::{debug, warn};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::grid::{Candidate, GridSearch};
use crate::mask::{expand_quad, fill_quad};
use crate::params::{ChessboardParams, PatternSize};
use crate::DetectError;

/// One fully detected board: `cols * rows` corners, row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChessboardInstance {
    pub pattern: PatternSize,
    pub corners: Vec<Point2<f64>>,
}

impl ChessboardInstance {
    /// Outer inner corners: first, last of first row, last, first of last row.
    pub fn outline(&self) -> [Point2<f64>; 4] {
        let cols = self.pattern.cols as usize;
        let n = self.corners.len();
        [
            self.corners[0],
            self.corners[cols - 1],
            self.corners[n - 1],
            self.corners[n - cols],
        ]
    }

    /// Mean distance between horizontally and vertically adjacent corners.
    pub fn mean_spacing(&self) -> f64 {
        let cols = self.pattern.cols as usize;
        let rows = self.pattern.rows as usize;
        let mut sum = 0.0;
        let mut count = 0usize;
        for r in 0..rows {
            for c in 0..cols {
                let p = self.corners[r * cols + c];
                if c + 1 < cols {
                    sum += (self.corners[r * cols + c + 1] - p).norm();
                    count += 1;
                }
                if r + 1 < rows {
                    sum += (self.corners[(r + 1) * cols + c] - p).norm();
                    count += 1;
                }
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }
}

/// Finds every instance of one chessboard pattern in a photograph by
/// repeatedly detecting a board and painting it out.
#[derive(Clone, Debug, Default)]
pub struct ChessboardDetector {
    pub params: ChessboardParams,
}

impl ChessboardDetector {
    pub fn new(params: ChessboardParams) -> Self {
        Self { params }
    }

    pub fn pattern(&self) -> PatternSize {
        self.params.pattern
    }

    fn chess_config(&self) -> ChessConfig {
        let mut cfg = ChessConfig::single_scale();
        cfg.threshold_mode = ThresholdMode::Relative;
        cfg.threshold_value = self.params.chess_threshold_rel;
        cfg.nms_radius = self.params.chess_nms_radius;
        cfg
    }

    /// Raw ChESS corner candidates. A detector failure is logged and
    /// treated as an image without candidates.
    pub fn candidates(&self, img: &GrayImage) -> Vec<Candidate> {
        let corners = match find_chess_corners_image(img, &self.chess_config()) {
            Ok(corners) => corners,
            Err(e) => {
                warn!("ChESS detection failed: {}", e);
                return Vec::new();
            }
        };
        corners
            .iter()
            .map(|c| Candidate {
                position: Point2::new(c.x as f64, c.y as f64),
                strength: c.response as f32,
            })
            .collect()
    }

    /// Single detection pass; `None` when no complete board is visible.
    pub fn detect_once(&self, img: &GrayImage) -> Option<ChessboardInstance> {
        let candidates = self.candidates(img);
        debug!("{} ChESS candidates", candidates.len());
        let corners = GridSearch::new(&candidates, &self.params).find()?;
        Some(ChessboardInstance {
            pattern: self.params.pattern,
            corners,
        })
    }

    /// Detect, mask, repeat until a pass comes back empty.
    ///
    /// Instances are returned in discovery order. An empty vector means no
    /// board was found. At most `iteration_limit()` boards are accepted; a
    /// final pass confirms nothing is left, and if it still finds a board
    /// the image is reported as [`DetectError::IterationBoundExceeded`].
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, img), fields(width = img.width(), height = img.height()))
    )]
    pub fn detect_all(&self, img: &GrayImage) -> Result<Vec<ChessboardInstance>, DetectError> {
        self.params.pattern.validate()?;
        let limit = self.params.iteration_limit();
        let mut work = img.clone();
        let mut found: Vec<ChessboardInstance> = Vec::new();

        for pass in 0..=limit {
            let Some(instance) = self.detect_once(&work) else {
                debug!("pass {}: no further board, {} found", pass, found.len());
                return Ok(found);
            };
            if found.len() == limit {
                break;
            }

            let margin = self.params.mask_margin_rel * instance.mean_spacing();
            let quad = expand_quad(&instance.outline(), margin);
            if !fill_quad(&mut work, &quad, self.params.mask_value) {
                warn!("pass {}: board outline collapsed, mask not applied", pass);
            }
            debug!(
                "pass {}: board at ({:.1}, {:.1})",
                pass, instance.corners[0].x, instance.corners[0].y
            );
            found.push(instance);
        }

        warn!(
            "detection still finds boards after {} passes ({} kept)",
            limit,
            found.len()
        );
        Err(DetectError::IterationBoundExceeded {
            found: found.len(),
            limit,
        })
    }
}
