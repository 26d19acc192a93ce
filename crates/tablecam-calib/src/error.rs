use tablecam_chessboard::DetectError;
use thiserror::Error;

/// Errors from the calibration solve.
#[derive(Debug, Error)]
pub enum CalibrateError {
    #[error("no calibration images supplied")]
    EmptyInput,

    #[error(
        "calibration solve failed with {images} images and {correspondences} correspondence sets: {reason}"
    )]
    SolveFailure {
        images: usize,
        correspondences: usize,
        reason: String,
    },

    #[error("image {index} is {got:?} after rotation, expected {expected:?}")]
    FrameSizeMismatch {
        index: usize,
        expected: (u32, u32),
        got: (u32, u32),
    },

    #[error(transparent)]
    Detect(#[from] DetectError),
}

/// Failures of the calibration cache.
///
/// `load` folds every variant into a cache miss; only `save` returns them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid session id {0:?}: use letters, digits, '_', '-' or '.'")]
    InvalidSessionId(String),

    #[error("corrupt calibration record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures inside the bundle solve; the calibrator wraps them into
/// [`CalibrateError::SolveFailure`] together with the input counts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    #[error("no correspondence sets to solve from")]
    NoObservations,

    #[error("correspondence set {index} has {image} image points for {object} object points")]
    BadObservation {
        index: usize,
        object: usize,
        image: usize,
    },

    #[error("homography of correspondence set {index} failed: {source}")]
    Homography {
        index: usize,
        source: tablecam_core::GeometryError,
    },

    #[error("board pose of correspondence set {0} could not be initialised")]
    Pose(usize),

    #[error("a board point projects behind the camera")]
    BehindCamera,

    #[error("solution is not finite or has a non-positive focal length")]
    Diverged,
}
