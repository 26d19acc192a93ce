//! Pinhole camera with Brown-Conrady lens distortion.
//!
//! Coefficient order follows the common `(k1, k2, p1, p2[, k3[, k4, k5, k6]])`
//! layout so records written by other calibration tools read back unchanged.

use crate::GeometryError;
use nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Fixed-point iterations used when inverting the distortion model.
pub const DEFAULT_UNDISTORT_ITERS: usize = 20;

/// Build a zero-skew intrinsic matrix.
pub fn camera_matrix(fx: f64, fy: f64, cx: f64, cy: f64) -> Matrix3<f64> {
    Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0)
}

/// True when `k` has finite, positive focal lengths and a projective last row
/// of `(0, 0, 1)`.
pub fn is_valid_camera_matrix(k: &Matrix3<f64>) -> bool {
    k.iter().all(|v| v.is_finite())
        && k[(0, 0)] > 1e-9
        && k[(1, 1)] > 1e-9
        && k[(2, 0)] == 0.0
        && k[(2, 1)] == 0.0
        && (k[(2, 2)] - 1.0).abs() < 1e-12
}

/// Radial/tangential lens distortion acting on normalized image coordinates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    /// Rational-model denominator terms, present only for 8-coefficient sets.
    pub rational: Option<[f64; 3]>,
}

impl Distortion {
    pub fn none() -> Self {
        Self::default()
    }

    /// Parse a coefficient sequence of length 0, 4, 5 or 8.
    pub fn from_coeffs(coeffs: &[f64]) -> Result<Self, GeometryError> {
        let at = |i: usize| coeffs.get(i).copied().unwrap_or(0.0);
        match coeffs.len() {
            0 | 4 | 5 => Ok(Self {
                k1: at(0),
                k2: at(1),
                p1: at(2),
                p2: at(3),
                k3: at(4),
                rational: None,
            }),
            8 => Ok(Self {
                k1: at(0),
                k2: at(1),
                p1: at(2),
                p2: at(3),
                k3: at(4),
                rational: Some([at(5), at(6), at(7)]),
            }),
            n => Err(GeometryError::DistortionLength(n)),
        }
    }

    /// Five coefficients, or eight when the rational terms are set.
    pub fn to_coeffs(&self) -> Vec<f64> {
        let mut out = vec![self.k1, self.k2, self.p1, self.p2, self.k3];
        if let Some(r) = self.rational {
            out.extend_from_slice(&r);
        }
        out
    }

    /// Apply distortion to an undistorted normalized point.
    #[inline]
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let mut radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        if let Some([k4, k5, k6]) = self.rational {
            radial /= 1.0 + k4 * r2 + k5 * r4 + k6 * r6;
        }
        let xy = x * y;
        let dx = 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * xy;
        (x * radial + dx, y * radial + dy)
    }

    /// Invert [`Distortion::distort`] by fixed-point iteration.
    pub fn undistort(&self, xd: f64, yd: f64, iters: usize) -> (f64, f64) {
        let (mut x, mut y) = (xd, yd);
        for _ in 0..iters {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let mut icdist = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
            if let Some([k4, k5, k6]) = self.rational {
                icdist /= 1.0 + k4 * r2 + k5 * r4 + k6 * r6;
            }
            if icdist.abs() < 1e-12 || !icdist.is_finite() {
                break;
            }
            let xy = x * y;
            let dx = 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * xy;
            x = (xd - dx) / icdist;
            y = (yd - dy) / icdist;
        }
        (x, y)
    }
}

/// Intrinsic matrix plus distortion: the full forward/backward pixel model.
#[derive(Clone, Debug, PartialEq)]
pub struct LensModel {
    pub k: Matrix3<f64>,
    pub distortion: Distortion,
}

impl LensModel {
    pub fn new(k: Matrix3<f64>, distortion: Distortion) -> Self {
        Self { k, distortion }
    }

    #[inline]
    pub fn fx(&self) -> f64 {
        self.k[(0, 0)]
    }
    #[inline]
    pub fn fy(&self) -> f64 {
        self.k[(1, 1)]
    }
    #[inline]
    pub fn cx(&self) -> f64 {
        self.k[(0, 2)]
    }
    #[inline]
    pub fn cy(&self) -> f64 {
        self.k[(1, 2)]
    }

    /// Distorted pixel for a normalized (undistorted) camera ray.
    #[inline]
    pub fn normalized_to_pixel(&self, x: f64, y: f64) -> Point2<f64> {
        let (xd, yd) = self.distortion.distort(x, y);
        let skew = self.k[(0, 1)];
        Point2::new(
            self.fx() * xd + skew * yd + self.cx(),
            self.fy() * yd + self.cy(),
        )
    }

    /// Undistorted normalized coordinates of a raw pixel.
    pub fn pixel_to_normalized(&self, p: Point2<f64>) -> (f64, f64) {
        let yd = (p.y - self.cy()) / self.fy();
        let xd = (p.x - self.cx() - self.k[(0, 1)] * yd) / self.fx();
        self.distortion
            .undistort(xd, yd, DEFAULT_UNDISTORT_ITERS)
    }

    /// Project a board point through a pose into a distorted pixel.
    ///
    /// Returns `None` for points at or behind the camera plane.
    pub fn project(
        &self,
        rotation: &Rotation3<f64>,
        translation: &Vector3<f64>,
        p: &Point3<f64>,
    ) -> Option<Point2<f64>> {
        let pc = rotation * p.coords + translation;
        if pc.z <= 1e-12 {
            return None;
        }
        Some(self.normalized_to_pixel(pc.x / pc.z, pc.y / pc.z))
    }

    /// Map a raw pixel into the undistorted image rendered with `new_k`.
    pub fn undistort_pixel(&self, p: Point2<f64>, new_k: &Matrix3<f64>) -> Point2<f64> {
        let (x, y) = self.pixel_to_normalized(p);
        let v = new_k * Vector3::new(x, y, 1.0);
        Point2::new(v[0] / v[2], v[1] / v[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn barrel() -> Distortion {
        Distortion::from_coeffs(&[-0.28, 0.09, 0.001, -0.0005, -0.01]).expect("five coeffs")
    }

    #[test]
    fn coefficient_lengths() {
        assert_eq!(
            Distortion::from_coeffs(&[]).expect("empty"),
            Distortion::default()
        );
        assert_eq!(
            Distortion::from_coeffs(&[0.1, 0.2, 0.0, 0.0])
                .expect("four")
                .to_coeffs(),
            vec![0.1, 0.2, 0.0, 0.0, 0.0]
        );
        let eight = Distortion::from_coeffs(&[0.1, 0.0, 0.0, 0.0, 0.0, 0.2, 0.0, 0.0])
            .expect("eight");
        assert_eq!(eight.to_coeffs().len(), 8);
        assert_eq!(
            Distortion::from_coeffs(&[0.1, 0.2, 0.3]),
            Err(GeometryError::DistortionLength(3))
        );
    }

    #[test]
    fn undistort_inverts_distort() {
        let d = barrel();
        for &(x, y) in &[(0.0, 0.0), (0.3, -0.2), (-0.45, 0.35), (0.1, 0.5)] {
            let (xd, yd) = d.distort(x, y);
            let (xu, yu) = d.undistort(xd, yd, 50);
            assert_abs_diff_eq!(xu, x, epsilon = 1e-8);
            assert_abs_diff_eq!(yu, y, epsilon = 1e-8);
        }
    }

    #[test]
    fn pixel_round_trip_through_lens() {
        let lens = LensModel::new(camera_matrix(900.0, 880.0, 640.0, 360.0), barrel());
        let raw = lens.normalized_to_pixel(0.25, -0.15);
        let (x, y) = lens.pixel_to_normalized(raw);
        assert_abs_diff_eq!(x, 0.25, epsilon = 1e-7);
        assert_abs_diff_eq!(y, -0.15, epsilon = 1e-7);

        let undistorted = lens.undistort_pixel(raw, &lens.k);
        assert_abs_diff_eq!(undistorted.x, 900.0 * 0.25 + 640.0, epsilon = 1e-4);
        assert_abs_diff_eq!(undistorted.y, 880.0 * -0.15 + 360.0, epsilon = 1e-4);
    }

    #[test]
    fn camera_matrix_validation() {
        assert!(is_valid_camera_matrix(&camera_matrix(800.0, 800.0, 320.0, 240.0)));
        assert!(!is_valid_camera_matrix(&camera_matrix(0.0, 800.0, 320.0, 240.0)));
        assert!(!is_valid_camera_matrix(&camera_matrix(f64::NAN, 800.0, 320.0, 240.0)));
    }
}
