//! Surface-plane homographies.
//!
//! The table surface is a rectangle of known physical size. Four surface
//! corners picked in the frame are mapped onto the canonical rectangle
//! `[(0,0), (W-1,0), (W-1,H-1), (0,H-1)]` with `W = width * sub_unit_scale`
//! and `H = height * sub_unit_scale`, so one canonical unit is one physical
//! sub-unit.

use image::{ImageBuffer, Pixel};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use log::{debug, info};
use nalgebra::{Matrix3, Point2};
use serde::{Deserialize, Serialize};
use tablecam_core::{
    homography_from_4pt, transform_point, transform_points, GeometryError, Homography,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::HomographyError;

/// Largest entry of `forward * inverse - I` (scaled to `m22 = 1`) accepted at build time.
const CONSISTENCY_TOL: f64 = 1e-6;

/// Physical size of the surface and the sub-unit resolution of canonical space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaneParams {
    /// Surface `(width, height)` in physical units.
    pub physical_size: (u32, u32),
    /// Canonical units per physical unit (100 keeps two decimal digits).
    pub sub_unit_scale: u32,
}

impl Default for PlaneParams {
    fn default() -> Self {
        Self {
            physical_size: (44, 88),
            sub_unit_scale: 100,
        }
    }
}

impl PlaneParams {
    /// Canonical `(W, H)`. Each side must be at least two units and fit in `u32`.
    pub fn target_dims(&self) -> Result<(u32, u32), HomographyError> {
        let side = |units: u32| {
            units
                .checked_mul(self.sub_unit_scale)
                .filter(|&v| v >= 2)
        };
        match (side(self.physical_size.0), side(self.physical_size.1)) {
            (Some(w), Some(h)) => Ok((w, h)),
            _ => Err(HomographyError::InvalidPlane {
                physical_size: self.physical_size,
                sub_unit_scale: self.sub_unit_scale,
            }),
        }
    }

    /// Canonical rectangle corners, clockwise from the origin.
    pub fn canonical_corners(&self) -> Result<[Point2<f64>; 4], HomographyError> {
        Ok(canonical_corners(self.target_dims()?))
    }
}

fn canonical_corners((w, h): (u32, u32)) -> [Point2<f64>; 4] {
    let (w, h) = (w as f64 - 1.0, h as f64 - 1.0);
    [
        Point2::new(0.0, 0.0),
        Point2::new(w, 0.0),
        Point2::new(w, h),
        Point2::new(0.0, h),
    ]
}

/// Frame-to-canonical mapping and its independently solved inverse.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HomographyModel {
    /// Frame pixels to canonical units.
    pub forward: Homography,
    /// Canonical units to frame pixels.
    pub inverse: Homography,
    pub target_dims: (u32, u32),
}

impl HomographyModel {
    pub fn canonical_corners(&self) -> [Point2<f64>; 4] {
        canonical_corners(self.target_dims)
    }

    pub fn to_canonical(&self, p: Point2<f64>) -> Result<Point2<f64>, HomographyError> {
        Ok(transform_point(&self.forward, p)?)
    }

    pub fn to_canonical_points(
        &self,
        pts: &[Point2<f64>],
    ) -> Result<Vec<Point2<f64>>, HomographyError> {
        Ok(transform_points(&self.forward, pts)?)
    }

    pub fn to_frame(&self, p: Point2<f64>) -> Result<Point2<f64>, HomographyError> {
        Ok(transform_point(&self.inverse, p)?)
    }

    pub fn to_frame_points(&self, pts: &[Point2<f64>]) -> Result<Vec<Point2<f64>>, HomographyError> {
        Ok(transform_points(&self.inverse, pts)?)
    }

    /// How far `forward * inverse` is from the identity.
    pub fn deviation(&self) -> f64 {
        let m: Matrix3<f64> = self.forward.h * self.inverse.h;
        if m[(2, 2)].abs() <= f64::EPSILON {
            return f64::INFINITY;
        }
        (m / m[(2, 2)] - Matrix3::identity()).amax()
    }
}

/// Builds [`HomographyModel`]s for one plane and warps frames into it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HomographyEngine {
    pub plane: PlaneParams,
}

impl HomographyEngine {
    pub fn new(plane: PlaneParams) -> Self {
        Self { plane }
    }

    /// Solve both directions from four surface corners given in canonical
    /// corner order (top-left, top-right, bottom-right, bottom-left).
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self)))]
    pub fn build(&self, corners: &[Point2<f64>; 4]) -> Result<HomographyModel, HomographyError> {
        let target_dims = self.plane.target_dims()?;
        let canonical = canonical_corners(target_dims);
        let degenerate = |source| HomographyError::Degenerate {
            corners: *corners,
            source,
        };

        let forward = homography_from_4pt(corners, &canonical).map_err(degenerate)?;
        let inverse = homography_from_4pt(&canonical, corners).map_err(degenerate)?;
        let model = HomographyModel {
            forward,
            inverse,
            target_dims,
        };

        let deviation = model.deviation();
        if deviation.is_nan() || deviation > CONSISTENCY_TOL {
            return Err(HomographyError::Inconsistent { deviation });
        }
        info!(
            "surface homography built for {}x{} canonical units",
            target_dims.0, target_dims.1
        );
        debug!("forward {:?}, deviation {:e}", forward.to_array(), deviation);
        Ok(model)
    }
}

/// Warp `frame` into the canonical rectangle of `model`. Canonical pixels
/// whose preimage falls outside the frame are black.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "debug", skip(frame, model), fields(dims = ?model.target_dims))
)]
pub fn to_canonical_image<P>(
    frame: &ImageBuffer<P, Vec<u8>>,
    model: &HomographyModel,
) -> Result<ImageBuffer<P, Vec<u8>>, HomographyError>
where
    P: Pixel<Subpixel = u8> + Send + Sync,
{
    let h = model.forward.to_array();
    let flat = [
        h[0][0], h[0][1], h[0][2], h[1][0], h[1][1], h[1][2], h[2][0], h[2][1], h[2][2],
    ]
    .map(|v| v as f32);
    let projection =
        Projection::from_matrix(flat).ok_or(HomographyError::Transform(GeometryError::SingularSystem))?;

    let black = vec![0u8; P::CHANNEL_COUNT as usize];
    let mut out = ImageBuffer::new(model.target_dims.0, model.target_dims.1);
    warp_into(
        frame,
        &projection,
        Interpolation::Bilinear,
        *P::from_slice(&black),
        &mut out,
    );
    Ok(out)
}
