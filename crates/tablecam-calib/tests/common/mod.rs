use image::{GrayImage, Luma};
use nalgebra::{Matrix3, Rotation3, Vector3};
use tablecam_core::{camera_matrix, Homography};

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const FOCAL: f64 = 520.0;
const SQUARES_X: u32 = 10;
const SQUARES_Y: u32 = 7;
const SUPERSAMPLE: u32 = 3;

pub fn true_camera() -> Matrix3<f64> {
    camera_matrix(FOCAL, FOCAL, 319.5, 239.5)
}

/// Board-square coordinates to pixels for a board centred at `t`, tilted by
/// `(rx, ry, rz)`.
pub fn board_view(rx: f64, ry: f64, rz: f64, t: Vector3<f64>) -> Homography {
    let r = Rotation3::from_euler_angles(rx, ry, rz);
    let r1 = r.matrix().column(0).into_owned();
    let r2 = r.matrix().column(1).into_owned();
    let origin = t - r1 * (SQUARES_X as f64 / 2.0) - r2 * (SQUARES_Y as f64 / 2.0);
    let rt = Matrix3::from_columns(&[r1, r2, origin]);
    Homography::new(true_camera() * rt)
}

/// Render `10x7`-square boards (9x6 inner corners) on a white background.
pub fn render(boards: &[Homography]) -> GrayImage {
    let inverses: Vec<Homography> = boards
        .iter()
        .map(|h| h.inverse().expect("invertible board mapping"))
        .collect();
    let n = (SUPERSAMPLE * SUPERSAMPLE) as f64;
    GrayImage::from_fn(WIDTH, HEIGHT, |x, y| {
        let mut acc = 0.0;
        for sy in 0..SUPERSAMPLE {
            for sx in 0..SUPERSAMPLE {
                let px = x as f64 - 0.5 + (sx as f64 + 0.5) / SUPERSAMPLE as f64;
                let py = y as f64 - 0.5 + (sy as f64 + 0.5) / SUPERSAMPLE as f64;
                acc += shade(&inverses, px, py);
            }
        }
        Luma([(acc / n).round() as u8])
    })
}

fn shade(inverses: &[Homography], x: f64, y: f64) -> f64 {
    for inv in inverses {
        let Ok(b) = inv.try_apply(nalgebra::Point2::new(x, y)) else {
            continue;
        };
        if b.x >= 0.0 && b.y >= 0.0 && b.x < SQUARES_X as f64 && b.y < SQUARES_Y as f64 {
            let parity = (b.x.floor() as i64 + b.y.floor() as i64) % 2;
            return if parity == 0 { 30.0 } else { 225.0 };
        }
    }
    255.0
}

/// Photo set: four single-board views and one frame holding two boards.
pub fn calibration_set() -> Vec<GrayImage> {
    let z = 24.0;
    vec![
        render(&[board_view(0.0, 0.0, 0.05, Vector3::new(0.0, 0.0, z))]),
        render(&[board_view(0.35, 0.0, -0.1, Vector3::new(-1.0, 0.5, z))]),
        render(&[board_view(0.0, 0.4, 0.1, Vector3::new(1.0, -0.5, z))]),
        render(&[board_view(-0.3, -0.3, 0.0, Vector3::new(0.5, 1.0, z))]),
        render(&[
            board_view(0.2, 0.25, 0.05, Vector3::new(-6.5, -1.0, z + 4.0)),
            board_view(-0.25, 0.2, -0.05, Vector3::new(6.5, 1.5, z + 4.0)),
        ]),
    ]
}
