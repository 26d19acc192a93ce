//! Core geometry for table camera rectification.
//!
//! This crate is purely numeric. It does *not* depend on an image library or
//! a corner detector; pixel buffers enter as [`GrayImageView`].

mod camera;
mod error;
mod homography;
mod image;

pub use camera::{
    camera_matrix, is_valid_camera_matrix, Distortion, LensModel, DEFAULT_UNDISTORT_ITERS,
};
pub use error::GeometryError;
pub use homography::{
    ensure_general_position, estimate_homography, homography_from_4pt, transform_point,
    transform_points, Homography, PROJECTIVE_EPS,
};
pub use image::{sample_bilinear, GrayImageView};
