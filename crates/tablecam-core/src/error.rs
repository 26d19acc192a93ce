/// Errors produced by the geometric primitives in this crate.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("degenerate point configuration: {reason}")]
    DegeneratePoints { reason: String },

    #[error("projective denominator {denominator:e} is below the divide threshold")]
    DegenerateTransform { denominator: f64 },

    #[error("linear system is singular")]
    SingularSystem,

    #[error("point count mismatch (src={src}, dst={dst})")]
    CountMismatch { src: usize, dst: usize },

    #[error("need at least {needed} correspondences, got {got}")]
    NotEnoughPoints { needed: usize, got: usize },

    #[error("unsupported distortion coefficient count {0} (expected 0, 4, 5 or 8)")]
    DistortionLength(usize),
}
