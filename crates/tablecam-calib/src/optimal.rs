use nalgebra::{Matrix3, Point2};
use tablecam_core::{camera_matrix, LensModel};

use crate::Roi;

/// Grid resolution used to trace the undistorted image border.
const BORDER_SAMPLES: usize = 9;

#[derive(Clone, Copy, Debug, PartialEq)]
struct RectF {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

/// Inscribed and bounding rectangles of the undistorted image, in normalized
/// coordinates (`new_k = None`) or in the pixels of `new_k`.
fn undistorted_rectangles(
    lens: &LensModel,
    new_k: Option<&Matrix3<f64>>,
    size: (u32, u32),
) -> (RectF, RectF) {
    let (w, h) = (size.0 as f64, size.1 as f64);
    let n = BORDER_SAMPLES;

    let (mut ix0, mut ix1, mut iy0, mut iy1) = (f64::MIN, f64::MAX, f64::MIN, f64::MAX);
    let (mut ox0, mut ox1, mut oy0, mut oy1) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);

    for y in 0..n {
        for x in 0..n {
            let raw = Point2::new(
                x as f64 * (w - 1.0) / (n - 1) as f64,
                y as f64 * (h - 1.0) / (n - 1) as f64,
            );
            let p = match new_k {
                Some(k) => lens.undistort_pixel(raw, k),
                None => {
                    let (xn, yn) = lens.pixel_to_normalized(raw);
                    Point2::new(xn, yn)
                }
            };

            ox0 = ox0.min(p.x);
            ox1 = ox1.max(p.x);
            oy0 = oy0.min(p.y);
            oy1 = oy1.max(p.y);
            if x == 0 {
                ix0 = ix0.max(p.x);
            }
            if x == n - 1 {
                ix1 = ix1.min(p.x);
            }
            if y == 0 {
                iy0 = iy0.max(p.y);
            }
            if y == n - 1 {
                iy1 = iy1.min(p.y);
            }
        }
    }

    (
        RectF {
            x: ix0,
            y: iy0,
            width: ix1 - ix0,
            height: iy1 - iy0,
        },
        RectF {
            x: ox0,
            y: oy0,
            width: ox1 - ox0,
            height: oy1 - oy0,
        },
    )
}

/// New camera matrix for undistorted frames of `size` plus the valid-pixel ROI.
///
/// `alpha = 0` keeps only valid pixels (zoomed in), `alpha = 1` keeps every
/// source pixel and leaves black borders. The ROI is the inscribed rectangle
/// of valid pixels under the new matrix, clipped to the frame.
pub fn optimal_new_camera_matrix(
    lens: &LensModel,
    size: (u32, u32),
    alpha: f64,
) -> (Matrix3<f64>, Roi) {
    let alpha = alpha.clamp(0.0, 1.0);
    let (w, h) = (size.0 as f64, size.1 as f64);
    let (inner, outer) = undistorted_rectangles(lens, None, size);

    let fx0 = (w - 1.0) / inner.width;
    let fy0 = (h - 1.0) / inner.height;
    let cx0 = -fx0 * inner.x;
    let cy0 = -fy0 * inner.y;

    let fx1 = (w - 1.0) / outer.width;
    let fy1 = (h - 1.0) / outer.height;
    let cx1 = -fx1 * outer.x;
    let cy1 = -fy1 * outer.y;

    let k = camera_matrix(
        fx0 * (1.0 - alpha) + fx1 * alpha,
        fy0 * (1.0 - alpha) + fy1 * alpha,
        cx0 * (1.0 - alpha) + cx1 * alpha,
        cy0 * (1.0 - alpha) + cy1 * alpha,
    );

    let (inner_px, _) = undistorted_rectangles(lens, Some(&k), size);
    let roi = Roi::new(
        inner_px.x.round() as i32,
        inner_px.y.round() as i32,
        inner_px.width.round() as i32,
        inner_px.height.round() as i32,
    )
    .intersect(&Roi::full(size.0, size.1));
    (k, roi)
}
