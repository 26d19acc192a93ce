use image::{GrayImage, Luma};
use nalgebra::{Matrix3, Point2};
use tablecam_core::Homography;

pub const SQUARES_X: u32 = 10;
pub const SQUARES_Y: u32 = 7;
const SUPERSAMPLE: u32 = 3;

/// Board-plane (square units) to image mapping: rotate by `angle`, scale to
/// `square_px` pixels per square, then translate.
pub fn similarity(angle: f64, square_px: f64, tx: f64, ty: f64) -> Homography {
    let (s, c) = angle.sin_cos();
    Homography::new(Matrix3::new(
        square_px * c,
        -square_px * s,
        tx,
        square_px * s,
        square_px * c,
        ty,
        0.0,
        0.0,
        1.0,
    ))
}

/// Render `10x7`-square boards (9x6 inner corners) on a white background.
pub fn render_boards(width: u32, height: u32, boards: &[Homography]) -> GrayImage {
    let inverses: Vec<Homography> = boards
        .iter()
        .map(|h| h.inverse().expect("invertible board mapping"))
        .collect();
    let n = (SUPERSAMPLE * SUPERSAMPLE) as f64;
    GrayImage::from_fn(width, height, |x, y| {
        let mut acc = 0.0;
        for sy in 0..SUPERSAMPLE {
            for sx in 0..SUPERSAMPLE {
                let px = x as f64 - 0.5 + (sx as f64 + 0.5) / SUPERSAMPLE as f64;
                let py = y as f64 - 0.5 + (sy as f64 + 0.5) / SUPERSAMPLE as f64;
                acc += shade(&inverses, Point2::new(px, py));
            }
        }
        Luma([(acc / n).round() as u8])
    })
}

fn shade(inverses: &[Homography], p: Point2<f64>) -> f64 {
    for inv in inverses {
        let b = inv.apply(p);
        if b.x >= 0.0 && b.y >= 0.0 && b.x < SQUARES_X as f64 && b.y < SQUARES_Y as f64 {
            let parity = (b.x.floor() as i64 + b.y.floor() as i64) % 2;
            return if parity == 0 { 30.0 } else { 225.0 };
        }
    }
    255.0
}

/// Image positions of the inner corners of one rendered board.
pub fn inner_corners(board: &Homography) -> Vec<Point2<f64>> {
    let mut out = Vec::new();
    for v in 1..SQUARES_Y {
        for u in 1..SQUARES_X {
            out.push(board.apply(Point2::new(u as f64, v as f64)));
        }
    }
    out
}
