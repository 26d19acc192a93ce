//! Multi-instance chessboard detector.
//!
//! ## Quickstart
//!
//! ```no_run
//! use tablecam_chessboard::{ChessboardDetector, ChessboardParams, PatternSize};
//!
//! let img = image::open("board.png").unwrap().to_luma8();
//! let detector = ChessboardDetector::new(ChessboardParams::for_pattern(PatternSize::new(9, 6)));
//! let boards = detector.detect_all(&img).unwrap();
//! println!("found {} boards", boards.len());
//! ```
//!
//! Pipeline per pass:
//! 1. ChESS corner candidates from `chess-corners`.
//! 2. Grow a `cols x rows` lattice from the strongest seeds (k-d tree lookups).
//! 3. Accept only complete lattices of exactly the pattern size, reorder them
//!    row-major with a consistent handedness.
//! 4. Paint the board outline with a flat gray so the next pass finds a
//!    different board.
//!
//! The loop stops on the first empty pass or after
//! [`ChessboardParams::iteration_limit`] passes.

mod detector;
mod error;
mod grid;
mod mask;
mod params;
mod subpix;

pub use detector::{ChessboardDetector, ChessboardInstance};
pub use error::DetectError;
pub use grid::Candidate;
pub use mask::{expand_quad, fill_quad};
pub use params::{ChessboardParams, PatternSize, SubpixParams};
pub use subpix::{refine_corner, refine_corners};
