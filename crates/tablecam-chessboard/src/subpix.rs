//! Gradient-orthogonality corner refinement.
//!
//! At a saddle point every image gradient inside a small window is
//! orthogonal to the vector joining the corner and the gradient sample.
//! Each iteration solves the resulting 2x2 weighted least-squares system
//! and recenters the window on the solution.

use nalgebra::Point2;
use tablecam_core::{sample_bilinear, GrayImageView};

use crate::params::SubpixParams;

/// Refine one corner estimate. Falls back to the input when the window is
/// flat or the solution drifts out of the search window.
pub fn refine_corner(
    img: &GrayImageView<'_>,
    initial: Point2<f64>,
    params: &SubpixParams,
) -> Point2<f64> {
    let half = params.half_window.max(1) as i32;
    let inv_half_sq = 1.0 / (half * half) as f64;
    let eps_sq = params.epsilon * params.epsilon;

    let weights: Vec<f64> = (-half..=half)
        .map(|k| (-(k * k) as f64 * inv_half_sq).exp())
        .collect();

    let mut current = initial;
    for _ in 0..params.max_iters.max(1) {
        let (mut a, mut b, mut c) = (0.0, 0.0, 0.0);
        let (mut bb1, mut bb2) = (0.0, 0.0);

        for dy in -half..=half {
            let wy = weights[(dy + half) as usize];
            for dx in -half..=half {
                let w = wy * weights[(dx + half) as usize];
                let x = current.x + dx as f64;
                let y = current.y + dy as f64;
                let gx = sample_bilinear(img, x + 1.0, y) - sample_bilinear(img, x - 1.0, y);
                let gy = sample_bilinear(img, x, y + 1.0) - sample_bilinear(img, x, y - 1.0);

                let gxx = gx * gx * w;
                let gxy = gx * gy * w;
                let gyy = gy * gy * w;
                let (px, py) = (dx as f64, dy as f64);

                a += gxx;
                b += gxy;
                c += gyy;
                bb1 += gxx * px + gxy * py;
                bb2 += gxy * px + gyy * py;
            }
        }

        let det = a * c - b * b;
        if det.abs() <= f64::EPSILON * a.max(c).max(1.0) {
            break;
        }
        let next = Point2::new(
            current.x + (c * bb1 - b * bb2) / det,
            current.y + (a * bb2 - b * bb1) / det,
        );
        let step_sq = (next - current).norm_squared();
        current = next;

        if !img.contains(current.x, current.y) || step_sq <= eps_sq {
            break;
        }
    }

    let drift = current - initial;
    if !current.x.is_finite()
        || !current.y.is_finite()
        || drift.x.abs() > half as f64
        || drift.y.abs() > half as f64
    {
        return initial;
    }
    current
}

/// Refine every corner in place.
pub fn refine_corners(img: &GrayImageView<'_>, corners: &mut [Point2<f64>], params: &SubpixParams) {
    for corner in corners.iter_mut() {
        *corner = refine_corner(img, *corner, params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Supersampled X-junction centered at `(cx, cy)`.
    fn saddle(width: usize, height: usize, cx: f64, cy: f64) -> Vec<u8> {
        const SS: usize = 4;
        let mut data = vec![0u8; width * height];
        for y in 0..height {
            for x in 0..width {
                let mut acc = 0.0;
                for sy in 0..SS {
                    for sx in 0..SS {
                        let px = x as f64 - 0.5 + (sx as f64 + 0.5) / SS as f64;
                        let py = y as f64 - 0.5 + (sy as f64 + 0.5) / SS as f64;
                        let dark = (px < cx) == (py < cy);
                        acc += if dark { 20.0 } else { 230.0 };
                    }
                }
                data[y * width + x] = (acc / (SS * SS) as f64).round() as u8;
            }
        }
        data
    }

    #[test]
    fn converges_to_subpixel_saddle() {
        let data = saddle(48, 48, 23.3, 24.7);
        let view = GrayImageView::new(48, 48, &data).expect("view");
        let refined = refine_corner(&view, Point2::new(24.0, 24.0), &SubpixParams::default());
        assert!((refined.x - 23.3).abs() < 0.15, "x = {}", refined.x);
        assert!((refined.y - 24.7).abs() < 0.15, "y = {}", refined.y);
    }

    #[test]
    fn flat_window_keeps_initial_estimate() {
        let data = vec![90u8; 32 * 32];
        let view = GrayImageView::new(32, 32, &data).expect("view");
        let start = Point2::new(15.5, 16.25);
        assert_eq!(refine_corner(&view, start, &SubpixParams::default()), start);
    }
}
