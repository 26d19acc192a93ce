use std::path::PathBuf;

use nalgebra::Point2;
use tablecam_calib::{CalibrateError, StoreError};
use tablecam_core::GeometryError;

/// Failures while building or applying a plane homography.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum HomographyError {
    #[error("surface corners {corners:?} cannot define a homography: {source}")]
    Degenerate {
        corners: [Point2<f64>; 4],
        #[source]
        source: GeometryError,
    },

    #[error(
        "plane of {physical_size:?} units at scale {sub_unit_scale} has no usable canonical size"
    )]
    InvalidPlane {
        physical_size: (u32, u32),
        sub_unit_scale: u32,
    },

    #[error("forward and inverse homographies disagree (deviation {deviation:e})")]
    Inconsistent { deviation: f64 },

    #[error(transparent)]
    Transform(#[from] GeometryError),
}

#[derive(thiserror::Error, Debug)]
pub enum MarkerError {
    #[error("cannot read marker list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed marker list: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("expected 4 surface corner markers, got {0}")]
    CornerCount(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot access config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything a [`crate::Session`] operation can fail with.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Calibrate(#[from] CalibrateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Homography(#[from] HomographyError),

    #[error(transparent)]
    Markers(#[from] MarkerError),

    #[error("no surface homography has been built for this session")]
    NoHomography,

    #[error("cannot list session directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
