use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use tablecam_core::{is_valid_camera_matrix, Distortion, LensModel};

/// Integer pixel rectangle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Roi {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole `width x height` frame.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Rectangle intersection; empty inputs or disjoint rectangles give the
    /// default (zero) rectangle.
    pub fn intersect(&self, other: &Roi) -> Roi {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        if x1 <= x0 || y1 <= y0 {
            return Roi::default();
        }
        Roi::new(x0, y0, x1 - x0, y1 - y0)
    }
}

/// Everything needed to rectify frames from one camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    /// Frames are turned 90 degrees clockwise before undistortion.
    pub rotate: bool,
    pub camera_matrix: Matrix3<f64>,
    pub distortion: Distortion,
    /// Camera matrix of the undistorted output frame.
    pub optimal_camera_matrix: Matrix3<f64>,
    /// Valid-pixel region of the undistorted frame.
    pub valid_roi: Roi,
}

impl CalibrationParameters {
    /// Distortion coefficients in `(k1, k2, p1, p2, k3[, k4, k5, k6])` order.
    pub fn distortion_coeffs(&self) -> Vec<f64> {
        self.distortion.to_coeffs()
    }

    pub fn lens(&self) -> LensModel {
        LensModel::new(self.camera_matrix, self.distortion.clone())
    }

    /// Both matrices finite with positive focal lengths.
    pub fn is_valid(&self) -> bool {
        is_valid_camera_matrix(&self.camera_matrix)
            && is_valid_camera_matrix(&self.optimal_camera_matrix)
            && self.distortion_coeffs().iter().all(|c| c.is_finite())
    }

    /// Same calibration with a replacement ROI.
    pub fn with_roi(&self, roi: Roi) -> Self {
        Self {
            valid_roi: roi,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roi_intersection() {
        let frame = Roi::full(640, 480);
        assert_eq!(
            Roi::new(-10, 20, 100, 500).intersect(&frame),
            Roi::new(0, 20, 90, 460)
        );
        assert!(Roi::new(700, 0, 10, 10).intersect(&frame).is_empty());
    }

    #[test]
    fn params_json_round_trip() {
        let params = CalibrationParameters {
            rotate: true,
            camera_matrix: tablecam_core::camera_matrix(800.0, 790.0, 320.0, 240.0),
            distortion: Distortion::from_coeffs(&[-0.2, 0.05, 0.001, 0.0, 0.0]).expect("5"),
            optimal_camera_matrix: tablecam_core::camera_matrix(700.0, 690.0, 330.0, 250.0),
            valid_roi: Roi::new(4, 6, 620, 460),
        };
        assert!(params.is_valid());
        let json = serde_json::to_string(&params).expect("serialize");
        let back: CalibrationParameters = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, params);
    }
}
