use std::path::Path;

use image::{imageops, DynamicImage, GrayImage};
use log::{info, warn};
use nalgebra::Point3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tablecam_chessboard::{
    refine_corners, ChessboardDetector, ChessboardParams, DetectError, SubpixParams,
};
use tablecam_core::GrayImageView;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::optimal::optimal_new_camera_matrix;
use crate::solver::{solve, ChessboardObservation, SolverParams};
use crate::{CalibrateError, CalibrationParameters};

/// Everything tunable about a calibration run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibratorConfig {
    pub chessboard: ChessboardParams,
    pub subpix: SubpixParams,
    pub solver: SolverParams,
    /// Board square edge in object units; intrinsics do not depend on it.
    pub square_size: f64,
    /// Free scaling of the undistorted frame (1 keeps every source pixel).
    pub alpha: f64,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            chessboard: ChessboardParams::default(),
            subpix: SubpixParams::default(),
            solver: SolverParams::default(),
            square_size: 1.0,
            alpha: 1.0,
        }
    }
}

/// How detection went on one calibration image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionOutcome {
    Found,
    NotFound,
    /// The mask-and-redetect bound tripped; the image contributes nothing.
    IterationBoundExceeded,
    /// The file could not be opened or decoded.
    Unreadable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionReport {
    /// Position in the input sequence.
    pub index: usize,
    /// Boards contributed to the solve.
    pub instances: usize,
    pub outcome: DetectionOutcome,
}

/// Calibration result plus per-image diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub params: CalibrationParameters,
    pub detections: Vec<DetectionReport>,
    /// Correspondence sets (board instances) used by the solve.
    pub correspondences: usize,
    /// RMS reprojection error in pixels.
    pub rms: f64,
    /// Residual evaluations spent by the bundle solve.
    pub evaluations: usize,
    /// Frame size after the optional rotation.
    pub image_size: (u32, u32),
}

struct ImageResult {
    report: DetectionReport,
    observations: Vec<ChessboardObservation>,
    size: Option<(u32, u32)>,
}

/// Detects chessboards across a photo set and solves camera intrinsics.
#[derive(Clone, Debug, Default)]
pub struct CameraCalibrator {
    pub config: CalibratorConfig,
}

impl CameraCalibrator {
    pub fn new(config: CalibratorConfig) -> Self {
        Self { config }
    }

    /// Board corners on `Z = 0`, row-major, matching detector order.
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        let pattern = self.config.chessboard.pattern;
        let s = self.config.square_size;
        (0..pattern.rows)
            .flat_map(|r| (0..pattern.cols).map(move |c| Point3::new(c as f64 * s, r as f64 * s, 0.0)))
            .collect()
    }

    pub fn calibrate(
        &self,
        images: &[DynamicImage],
        rotate: bool,
    ) -> Result<CalibrationParameters, CalibrateError> {
        self.calibrate_with_report(images, rotate).map(|r| r.params)
    }

    /// Calibrate from decoded images, processed in parallel and merged in
    /// input order.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, images), fields(images = images.len()))
    )]
    pub fn calibrate_with_report(
        &self,
        images: &[DynamicImage],
        rotate: bool,
    ) -> Result<CalibrationReport, CalibrateError> {
        if images.is_empty() {
            return Err(CalibrateError::EmptyInput);
        }
        self.config.chessboard.pattern.validate()?;
        let detector = ChessboardDetector::new(self.config.chessboard.clone());

        let results: Vec<ImageResult> = images
            .par_iter()
            .enumerate()
            .map(|(index, img)| self.process(&detector, index, prepare(img.to_luma8(), rotate)))
            .collect();
        self.finish(results, rotate)
    }

    /// Calibrate from image files. Files that fail to open or decode are
    /// reported as [`DetectionOutcome::Unreadable`] and skipped.
    pub fn calibrate_files<P>(
        &self,
        paths: &[P],
        rotate: bool,
    ) -> Result<CalibrationReport, CalibrateError>
    where
        P: AsRef<Path> + Sync,
    {
        if paths.is_empty() {
            return Err(CalibrateError::EmptyInput);
        }
        self.config.chessboard.pattern.validate()?;
        let detector = ChessboardDetector::new(self.config.chessboard.clone());

        let results: Vec<ImageResult> = paths
            .par_iter()
            .enumerate()
            .map(|(index, path)| match image::open(path.as_ref()) {
                Ok(img) => self.process(&detector, index, prepare(img.to_luma8(), rotate)),
                Err(e) => {
                    warn!("image {} ({}): {}", index, path.as_ref().display(), e);
                    ImageResult {
                        report: DetectionReport {
                            index,
                            instances: 0,
                            outcome: DetectionOutcome::Unreadable,
                        },
                        observations: Vec::new(),
                        size: None,
                    }
                }
            })
            .collect();
        self.finish(results, rotate)
    }

    fn process(&self, detector: &ChessboardDetector, index: usize, gray: GrayImage) -> ImageResult {
        let size = Some(gray.dimensions());
        let instances = match detector.detect_all(&gray) {
            Ok(found) if found.is_empty() => {
                info!("image {}: no chessboard found", index);
                return ImageResult {
                    report: DetectionReport {
                        index,
                        instances: 0,
                        outcome: DetectionOutcome::NotFound,
                    },
                    observations: Vec::new(),
                    size,
                };
            }
            Ok(found) => found,
            Err(DetectError::IterationBoundExceeded { found, limit }) => {
                warn!(
                    "image {}: detection stopped at the {}-pass bound with {} boards, skipping image",
                    index, limit, found
                );
                return ImageResult {
                    report: DetectionReport {
                        index,
                        instances: 0,
                        outcome: DetectionOutcome::IterationBoundExceeded,
                    },
                    observations: Vec::new(),
                    size,
                };
            }
            Err(e) => {
                warn!("image {}: {}", index, e);
                return ImageResult {
                    report: DetectionReport {
                        index,
                        instances: 0,
                        outcome: DetectionOutcome::NotFound,
                    },
                    observations: Vec::new(),
                    size,
                };
            }
        };

        let view = GrayImageView {
            width: gray.width() as usize,
            height: gray.height() as usize,
            data: gray.as_raw(),
        };
        let object = self.object_points();
        let observations: Vec<ChessboardObservation> = instances
            .into_iter()
            .map(|instance| {
                let mut corners = instance.corners;
                refine_corners(&view, &mut corners, &self.config.subpix);
                ChessboardObservation {
                    object_points: object.clone(),
                    image_points: corners,
                }
            })
            .collect();

        info!("image {}: {} boards", index, observations.len());
        ImageResult {
            report: DetectionReport {
                index,
                instances: observations.len(),
                outcome: DetectionOutcome::Found,
            },
            observations,
            size,
        }
    }

    fn finish(
        &self,
        results: Vec<ImageResult>,
        rotate: bool,
    ) -> Result<CalibrationReport, CalibrateError> {
        let images = results.len();
        let mut image_size: Option<(u32, u32)> = None;
        let mut observations = Vec::new();
        let mut detections = Vec::with_capacity(images);

        for result in results {
            // images without boards contribute nothing, whatever their size
            let contributing = result.size.filter(|_| !result.observations.is_empty());
            if let Some(size) = contributing {
                match image_size {
                    Some(expected) if expected != size => {
                        return Err(CalibrateError::FrameSizeMismatch {
                            index: result.report.index,
                            expected,
                            got: size,
                        });
                    }
                    _ => image_size = Some(size),
                }
            }
            observations.extend(result.observations);
            detections.push(result.report);
        }

        let correspondences = observations.len();
        let Some(image_size) = image_size.filter(|_| correspondences > 0) else {
            return Err(CalibrateError::SolveFailure {
                images,
                correspondences,
                reason: "no chessboard was detected in any image".to_string(),
            });
        };

        let outcome = solve(&observations, image_size, &self.config.solver).map_err(|e| {
            CalibrateError::SolveFailure {
                images,
                correspondences,
                reason: e.to_string(),
            }
        })?;
        let (optimal, roi) = optimal_new_camera_matrix(&outcome.lens, image_size, self.config.alpha);

        info!(
            "calibrated from {} boards in {} images: rms {:.4}px after {} evaluations",
            correspondences, images, outcome.rms, outcome.evaluations
        );

        Ok(CalibrationReport {
            params: CalibrationParameters {
                rotate,
                camera_matrix: outcome.lens.k,
                distortion: outcome.lens.distortion,
                optimal_camera_matrix: optimal,
                valid_roi: roi,
            },
            detections,
            correspondences,
            rms: outcome.rms,
            evaluations: outcome.evaluations,
            image_size,
        })
    }
}

/// Apply the fixed 90 degree clockwise rotation when requested.
pub fn prepare(gray: GrayImage, rotate: bool) -> GrayImage {
    if rotate {
        imageops::rotate90(&gray)
    } else {
        gray
    }
}
