//! Detect every instance of a chessboard pattern in one image and print the
//! corners as JSON.
//!
//! Usage: `cargo run -p tablecam-chessboard --example detect_boards -- <image> [cols rows]`

use std::env;

use tablecam_chessboard::{ChessboardDetector, ChessboardParams, PatternSize};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let path = args.next().ok_or("usage: detect_boards <image> [cols rows]")?;
    let cols: u32 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(9);
    let rows: u32 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(6);

    let img = image::open(&path)?.to_luma8();
    let detector = ChessboardDetector::new(ChessboardParams::for_pattern(PatternSize::new(
        cols, rows,
    )));
    let instances = detector.detect_all(&img)?;
    eprintln!("{}: {} boards", path, instances.len());
    println!("{}", serde_json::to_string_pretty(&instances)?);
    Ok(())
}
