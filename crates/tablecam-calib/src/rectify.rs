use std::sync::{Arc, Mutex, PoisonError, RwLock};

use image::{imageops, ImageBuffer, Pixel};
use log::debug;
use nalgebra::{Matrix3, Point2, Vector3};
use rayon::prelude::*;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{CalibrationParameters, Roi};

type Frame<P> = ImageBuffer<P, Vec<u8>>;

/// Source positions this far outside the frame still snap to the edge pixel.
const EDGE_TOL: f32 = 1e-3;

/// Per-pixel source coordinates of the undistorted frame.
#[derive(Clone, Debug)]
pub struct UndistortMap {
    width: u32,
    height: u32,
    coords: Vec<[f32; 2]>,
}

impl UndistortMap {
    /// For each output pixel, the raw-frame position it samples: back through
    /// the optimal camera matrix, through the distortion model, into the
    /// original camera matrix.
    pub fn new(params: &CalibrationParameters, size: (u32, u32)) -> Self {
        let (width, height) = size;
        let lens = params.lens();
        let new_k_inv = params
            .optimal_camera_matrix
            .try_inverse()
            .unwrap_or_else(Matrix3::identity);

        let mut coords = vec![[f32::NAN; 2]; width as usize * height as usize];
        coords
            .par_chunks_mut(width.max(1) as usize)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, slot) in row.iter_mut().enumerate() {
                    let ray = new_k_inv * Vector3::new(x as f64, y as f64, 1.0);
                    if ray.z.abs() <= f64::EPSILON {
                        continue;
                    }
                    let src = lens.normalized_to_pixel(ray.x / ray.z, ray.y / ray.z);
                    *slot = [src.x as f32, src.y as f32];
                }
            });
        Self {
            width,
            height,
            coords,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Resample `src` through the map; pixels that fall outside the source are black.
    pub fn remap<P>(&self, src: &Frame<P>) -> Frame<P>
    where
        P: Pixel<Subpixel = u8> + Send + Sync,
    {
        let channels = P::CHANNEL_COUNT as usize;
        let (sw, sh) = src.dimensions();
        let raw: &[u8] = src.as_raw();
        let mut out: Frame<P> = ImageBuffer::new(self.width, self.height);
        let row_len = self.width.max(1) as usize * channels;
        let max_x = sw as f32 - 1.0;
        let max_y = sh as f32 - 1.0;

        out.par_chunks_mut(row_len)
            .zip(self.coords.par_chunks(self.width.max(1) as usize))
            .for_each(|(row, coords)| {
                for (x, &[sx, sy]) in coords.iter().enumerate() {
                    if !(sx > -EDGE_TOL
                        && sy > -EDGE_TOL
                        && sx < max_x + EDGE_TOL
                        && sy < max_y + EDGE_TOL)
                    {
                        continue;
                    }
                    let sx = sx.clamp(0.0, max_x);
                    let sy = sy.clamp(0.0, max_y);
                    let x0 = sx.floor() as usize;
                    let y0 = sy.floor() as usize;
                    let x1 = (x0 + 1).min(sw as usize - 1);
                    let y1 = (y0 + 1).min(sh as usize - 1);
                    let fx = sx - x0 as f32;
                    let fy = sy - y0 as f32;
                    let at = |xx: usize, yy: usize, ch: usize| {
                        raw[(yy * sw as usize + xx) * channels + ch] as f32
                    };
                    for ch in 0..channels {
                        let top = at(x0, y0, ch) + fx * (at(x1, y0, ch) - at(x0, y0, ch));
                        let bottom = at(x0, y1, ch) + fx * (at(x1, y1, ch) - at(x0, y1, ch));
                        let v = top + fy * (bottom - top);
                        row[x * channels + ch] = v.round().clamp(0.0, 255.0) as u8;
                    }
                }
            });
        out
    }
}

/// Undistorted frame, full size and cut down to the valid ROI.
#[derive(Clone, Debug)]
pub struct Rectified<P: Pixel<Subpixel = u8>> {
    pub cropped: Frame<P>,
    pub uncropped: Frame<P>,
    /// ROI actually applied (clipped to the frame).
    pub roi: Roi,
}

/// The part of `roi` that lies inside a `size` frame.
fn applied_roi(roi: Roi, size: (u32, u32)) -> Roi {
    roi.intersect(&Roi::full(size.0, size.1))
}

fn crop<P>(frame: &Frame<P>, roi: Roi) -> (Frame<P>, Roi)
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let roi = applied_roi(roi, frame.dimensions());
    if roi.is_empty() {
        return (ImageBuffer::new(0, 0), roi);
    }
    let cut = imageops::crop_imm(
        frame,
        roi.x as u32,
        roi.y as u32,
        roi.width as u32,
        roi.height as u32,
    )
    .to_image();
    (cut, roi)
}

fn orient<P>(frame: &Frame<P>, rotate: bool) -> Option<Frame<P>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    rotate.then(|| imageops::rotate90(frame))
}

/// One-shot rectification without map caching.
pub fn rectify_frame<P>(frame: &Frame<P>, params: &CalibrationParameters) -> Rectified<P>
where
    P: Pixel<Subpixel = u8> + Send + Sync + 'static,
{
    let rotated = orient(frame, params.rotate);
    let input = rotated.as_ref().unwrap_or(frame);
    let map = UndistortMap::new(params, input.dimensions());
    let uncropped = map.remap(input);
    let (cropped, roi) = crop(&uncropped, params.valid_roi);
    Rectified {
        cropped,
        uncropped,
        roi,
    }
}

/// Rotates, undistorts and crops frames for one calibration.
///
/// Safe to share between threads. [`Rectifier::override_roi`] swaps the
/// parameters under a write lock; each `rectify` call works on one snapshot,
/// so it sees either the old or the new ROI, never a mix.
#[derive(Debug)]
pub struct Rectifier {
    params: RwLock<Arc<CalibrationParameters>>,
    map: Mutex<Option<Arc<UndistortMap>>>,
}

impl Rectifier {
    pub fn new(params: CalibrationParameters) -> Self {
        Self {
            params: RwLock::new(Arc::new(params)),
            map: Mutex::new(None),
        }
    }

    /// Current parameter snapshot.
    pub fn params(&self) -> Arc<CalibrationParameters> {
        self.params
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the crop rectangle; returns the previous one.
    pub fn override_roi(&self, roi: Roi) -> Roi {
        let mut guard = self.params.write().unwrap_or_else(PoisonError::into_inner);
        let previous = guard.valid_roi;
        *guard = Arc::new(guard.with_roi(roi));
        debug!("valid ROI overridden: {:?} -> {:?}", previous, roi);
        previous
    }

    fn map_for(&self, params: &CalibrationParameters, size: (u32, u32)) -> Arc<UndistortMap> {
        let mut slot = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(map) if map.size() == size => map.clone(),
            _ => {
                debug!("building undistortion map for {}x{}", size.0, size.1);
                let map = Arc::new(UndistortMap::new(params, size));
                *slot = Some(map.clone());
                map
            }
        }
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, frame), fields(width = frame.width(), height = frame.height()))
    )]
    pub fn rectify<P>(&self, frame: &Frame<P>) -> Rectified<P>
    where
        P: Pixel<Subpixel = u8> + Send + Sync + 'static,
    {
        let params = self.params();
        let rotated = orient(frame, params.rotate);
        let input = rotated.as_ref().unwrap_or(frame);
        let uncropped = self.map_for(&params, input.dimensions()).remap(input);
        let (cropped, roi) = crop(&uncropped, params.valid_roi);
        Rectified {
            cropped,
            uncropped,
            roi,
        }
    }

    /// Raw-frame pixels (already in rotated orientation when `rotate` is set)
    /// to pixels of the uncropped undistorted frame.
    pub fn undistort_points(&self, points: &[Point2<f64>]) -> Vec<Point2<f64>> {
        let params = self.params();
        let lens = params.lens();
        points
            .iter()
            .map(|&p| lens.undistort_pixel(p, &params.optimal_camera_matrix))
            .collect()
    }

    /// Uncropped undistorted pixels to pixels of the cropped frame, for an
    /// uncropped frame of `uncropped_size`. The ROI is clipped to the frame
    /// exactly as [`Rectifier::rectify`] clips it.
    pub fn to_cropped(
        &self,
        points: &[Point2<f64>],
        uncropped_size: (u32, u32),
    ) -> Vec<Point2<f64>> {
        let roi = applied_roi(self.params().valid_roi, uncropped_size);
        points
            .iter()
            .map(|p| Point2::new(p.x - roi.x as f64, p.y - roi.y as f64))
            .collect()
    }
}
