//! Table camera rectification pipeline.
//!
//! A session is a directory of calibration photographs. The first time a
//! session is opened its camera is calibrated from the chessboards in those
//! photos and the result is cached; afterwards frames are rotated,
//! undistorted and cropped with the cached parameters. Four surface corners
//! then define a homography onto a canonical rectangle of the table's
//! physical size.
//!
//! ## Quickstart
//!
//! ```no_run
//! use tablecam::{MarkerList, PipelineConfig, Session};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let session = Session::open("sessions/table-1", &config)?;
//!
//! let frame = image::open("frame.png")?.to_rgb8();
//! let rectified = session.rectify(&frame);
//! rectified.cropped.save("frame_rectified.png")?;
//!
//! session.set_surface(&MarkerList::load("sessions/table-1/corners.json")?)?;
//! for m in session.map_markers(&MarkerList::load("sessions/table-1/markers.json")?)? {
//!     println!("{}: {:.2}, {:.2}", m.label, m.canonical.x, m.canonical.y);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `tablecam::core`: homographies, lens model, logging.
//! - `tablecam::chessboard`: multi-instance chessboard detection.
//! - `tablecam::calib`: calibration, calibration cache, rectification.
//! - [`HomographyEngine`], [`MarkerList`], [`Session`]: the surface plane.

pub use tablecam_calib as calib;
pub use tablecam_chessboard as chessboard;
pub use tablecam_core as core;

pub use tablecam_calib::{
    CalibrationParameters, CalibrationStore, CameraCalibrator, Rectified, Rectifier, Roi,
};
pub use tablecam_chessboard::{ChessboardDetector, PatternSize};

mod config;
mod error;
mod markers;
mod plane;
mod session;

pub use config::PipelineConfig;
pub use error::{ConfigError, HomographyError, MarkerError, SessionError};
pub use markers::{swap_axes, Marker, MarkerList};
pub use plane::{to_canonical_image, HomographyEngine, HomographyModel, PlaneParams};
pub use session::{collect_image_paths, ensure_calibration, MappedMarker, Session};
