use thiserror::Error;

/// Errors produced by the chessboard detector.
///
/// A board that is simply not visible is not an error; detection returns an
/// empty instance list in that case.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectError {
    #[error("invalid pattern size {cols}x{rows}: need at least 2x2 inner corners")]
    InvalidPattern { cols: u32, rows: u32 },

    #[error("detect-then-mask loop hit its bound of {limit} passes after finding {found} boards")]
    IterationBoundExceeded { found: usize, limit: usize },
}
