//! Camera calibration, calibration cache and frame rectification.
//!
//! ```no_run
//! use tablecam_calib::{CalibrationStore, CameraCalibrator, Rectifier};
//!
//! let paths = ["calib/0001.png", "calib/0002.png"];
//! let report = CameraCalibrator::default().calibrate_files(&paths, false).unwrap();
//! CalibrationStore::new("cache").save("table-1", &report.params).unwrap();
//!
//! let rectifier = Rectifier::new(report.params);
//! let frame = image::open("frame.png").unwrap().to_rgb8();
//! let out = rectifier.rectify(&frame);
//! println!("cropped to {:?}", out.roi);
//! ```
//!
//! Calibration runs chessboard detection on every image in parallel, refines
//! corners to subpixel accuracy and solves a pinhole model with
//! Brown-Conrady distortion (`k1, k2, p1, p2, k3`) by Levenberg-Marquardt.
//! The optimal camera matrix and valid ROI are derived for `alpha`
//! (1 by default, every source pixel kept).

mod calibrator;
mod error;
mod optimal;
mod params;
mod rectify;
mod solver;
mod store;

pub use calibrator::{
    prepare, CalibrationReport, CalibratorConfig, CameraCalibrator, DetectionOutcome,
    DetectionReport,
};
pub use error::{CalibrateError, SolveError, StoreError};
pub use optimal::optimal_new_camera_matrix;
pub use params::{CalibrationParameters, Roi};
pub use rectify::{rectify_frame, Rectified, Rectifier, UndistortMap};
pub use solver::{
    init_intrinsics, pose_from_homography, reprojection_rms, solve, BoardPose,
    ChessboardObservation, SolveOutcome, SolverParams,
};
pub use store::{
    decode, encode, validate_session_id, CalibrationStore, RECORD_EXTENSION, RECORD_MAGIC,
    RECORD_VERSION,
};
