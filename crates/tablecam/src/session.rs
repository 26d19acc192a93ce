use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use image::{ImageBuffer, Pixel};
use log::{info, warn};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use tablecam_calib::{
    CalibrationParameters, CalibrationStore, CalibratorConfig, CameraCalibrator, Rectified,
    Rectifier, Roi,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::plane::to_canonical_image;
use crate::{
    HomographyEngine, HomographyModel, MarkerList, PipelineConfig, PlaneParams, SessionError,
};

/// Image extensions picked up from a session directory.
const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Calibration photos of a session directory, sorted by file name.
pub fn collect_image_paths(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, SessionError> {
    let dir = dir.as_ref();
    let io_err = |source| SessionError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Cached parameters for `session`, or a fresh calibration from `paths`
/// that is then written back to the store.
///
/// A cached record calibrated with a different `rotate` flag counts as a
/// miss. A failed write is logged; the fresh parameters are still returned.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(store, paths, config), fields(images = paths.len()))
)]
pub fn ensure_calibration<P>(
    store: &CalibrationStore,
    session: &str,
    paths: &[P],
    config: &CalibratorConfig,
    rotate: bool,
) -> Result<CalibrationParameters, SessionError>
where
    P: AsRef<Path> + Sync,
{
    store.path_for(session)?;
    match store.load(session) {
        Some(params) if params.rotate == rotate => return Ok(params),
        Some(_) => info!("cached calibration for {session:?} has the other rotation, recalibrating"),
        None => info!("calibrating session {session:?} from {} images", paths.len()),
    }

    let report = CameraCalibrator::new(config.clone()).calibrate_files(paths, rotate)?;
    if let Err(e) = store.save(session, &report.params) {
        warn!("calibration for {session:?} not cached: {e}");
    }
    Ok(report.params)
}

/// A surface marker in canonical coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MappedMarker {
    pub label: String,
    /// Position in the processing frame (after the axis swap).
    pub frame: Point2<f64>,
    /// Position on the canonical plane.
    pub canonical: Point2<f64>,
}

/// One camera setup: its calibration and, once built, its surface homography.
///
/// Shared by reference between threads. Rebuilding the homography or
/// overriding the ROI replaces a snapshot under a write lock, so readers see
/// the old or the new value and never a partial update.
#[derive(Debug)]
pub struct Session {
    id: String,
    rectifier: Rectifier,
    engine: HomographyEngine,
    model: RwLock<Option<Arc<HomographyModel>>>,
}

impl Session {
    pub fn new(id: impl Into<String>, params: CalibrationParameters, plane: PlaneParams) -> Self {
        Self {
            id: id.into(),
            rectifier: Rectifier::new(params),
            engine: HomographyEngine::new(plane),
            model: RwLock::new(None),
        }
    }

    /// Open the session stored in `dir`: its id is the directory name, its
    /// images are the photos inside.
    pub fn open(dir: impl AsRef<Path>, config: &PipelineConfig) -> Result<Self, SessionError> {
        let dir = dir.as_ref();
        let id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let store = CalibrationStore::new(&config.cache_dir);
        let paths = collect_image_paths(dir)?;
        let params = ensure_calibration(&store, &id, &paths, &config.calibrator, config.rotate)?;
        Ok(Self::new(id, params, config.plane))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rotate(&self) -> bool {
        self.rectifier.params().rotate
    }

    pub fn params(&self) -> Arc<CalibrationParameters> {
        self.rectifier.params()
    }

    pub fn rectifier(&self) -> &Rectifier {
        &self.rectifier
    }

    pub fn override_roi(&self, roi: Roi) -> Roi {
        self.rectifier.override_roi(roi)
    }

    pub fn rectify<P>(&self, frame: &ImageBuffer<P, Vec<u8>>) -> Rectified<P>
    where
        P: Pixel<Subpixel = u8> + Send + Sync + 'static,
    {
        self.rectifier.rectify(frame)
    }

    /// Build and install the surface homography from four corner markers
    /// collected against the unrotated frame.
    pub fn set_surface(&self, corners: &MarkerList) -> Result<Arc<HomographyModel>, SessionError> {
        let quad = corners.corner_quad(self.rotate())?;
        let model = Arc::new(self.engine.build(&quad)?);
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = Some(model.clone());
        Ok(model)
    }

    pub fn model(&self) -> Option<Arc<HomographyModel>> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_model(&self) -> Result<Arc<HomographyModel>, SessionError> {
        self.model().ok_or(SessionError::NoHomography)
    }

    /// Map markers onto the canonical plane, in list order.
    ///
    /// With `rotate` set, marker positions take a plain `(x, y) -> (y, x)`
    /// swap, while frames are turned clockwise, which sends pixel `(x, y)` of
    /// an `H`-row image to `(H-1-y, x)`. The two differ by a horizontal
    /// mirror, so on rotated sessions marker output and [`Self::canonical_frame`]
    /// imagery are mirrored relative to each other. Corners for
    /// [`Self::set_surface`] take the same swap, so markers and corners stay
    /// consistent with each other.
    pub fn map_markers(&self, markers: &MarkerList) -> Result<Vec<MappedMarker>, SessionError> {
        let model = self.require_model()?;
        let rotate = self.rotate();
        markers
            .markers
            .iter()
            .map(|m| -> Result<MappedMarker, SessionError> {
                let frame = m.control_point(rotate);
                Ok(MappedMarker {
                    label: m.label.clone(),
                    frame,
                    canonical: model.to_canonical(frame)?,
                })
            })
            .collect()
    }

    /// Rectify `frame` and warp the uncropped result onto the canonical plane.
    pub fn canonical_frame<P>(
        &self,
        frame: &ImageBuffer<P, Vec<u8>>,
    ) -> Result<ImageBuffer<P, Vec<u8>>, SessionError>
    where
        P: Pixel<Subpixel = u8> + Send + Sync + 'static,
    {
        let model = self.require_model()?;
        let rectified = self.rectifier.rectify(frame);
        Ok(to_canonical_image(&rectified.uncropped, &model)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{GrayImage, Luma};
    use tablecam_core::{camera_matrix, Distortion};

    fn identity_params(rotate: bool, w: u32, h: u32) -> CalibrationParameters {
        let k = camera_matrix(400.0, 400.0, (w as f64 - 1.0) / 2.0, (h as f64 - 1.0) / 2.0);
        CalibrationParameters {
            rotate,
            camera_matrix: k,
            distortion: Distortion::none(),
            optimal_camera_matrix: k,
            valid_roi: Roi::full(w, h),
        }
    }

    fn plane() -> PlaneParams {
        PlaneParams {
            physical_size: (4, 2),
            sub_unit_scale: 10,
        }
    }

    #[test]
    fn markers_need_a_surface_first() {
        let session = Session::new("s", identity_params(false, 80, 40), plane());
        let markers = MarkerList::from_json_str("[[1, 1]]").expect("parse");
        assert!(matches!(
            session.map_markers(&markers),
            Err(SessionError::NoHomography)
        ));
    }

    #[test]
    fn rotated_session_swaps_marker_axes() {
        let session = Session::new("s", identity_params(true, 40, 80), plane());
        // corners picked on the unrotated 40x80 frame
        let corners =
            MarkerList::from_json_str("[[0, 0], [0, 79], [39, 79], [39, 0]]").expect("parse");
        let model = session.set_surface(&corners).expect("surface");
        assert_eq!(model.target_dims, (40, 20));

        let markers =
            MarkerList::from_json_str(r#"{"markers": [{"label": "m", "x": 10, "y": 20}]}"#)
                .expect("parse");
        let mapped = session.map_markers(&markers).expect("map");
        assert_eq!(mapped[0].frame, Point2::new(20.0, 10.0));
        assert_relative_eq!(mapped[0].canonical.x, 20.0 * 39.0 / 79.0, epsilon = 1e-9);
        assert_relative_eq!(mapped[0].canonical.y, 10.0 * 19.0 / 39.0, epsilon = 1e-9);
    }

    #[test]
    fn marker_swap_mirrors_the_clockwise_frame_rotation() {
        // a bright pixel at (10, 20) on an unrotated 40x80 frame
        let mut raw = GrayImage::new(40, 80);
        raw.put_pixel(10, 20, Luma([255]));
        let turned = image::imageops::rotate90(&raw);
        assert_eq!(turned.get_pixel(80 - 1 - 20, 10).0[0], 255);

        let swapped = MarkerList::from_json_str("[[10, 20]]")
            .expect("parse")
            .markers[0]
            .control_point(true);
        assert_eq!(swapped, Point2::new(20.0, 10.0));
        assert_eq!(turned.width() as f64 - 1.0 - swapped.x, 59.0);
    }

    #[test]
    fn canonical_frame_has_target_dims() {
        let session = Session::new("s", identity_params(false, 80, 40), plane());
        let corners =
            MarkerList::from_json_str("[[0, 0], [79, 0], [79, 39], [0, 39]]").expect("parse");
        session.set_surface(&corners).expect("surface");
        let frame = GrayImage::from_fn(80, 40, |x, _| Luma([if x < 40 { 10 } else { 240 }]));
        let out = session.canonical_frame(&frame).expect("warp");
        assert_eq!(out.dimensions(), (40, 20));
        assert_eq!(out.get_pixel(5, 10).0[0], 10);
        assert_eq!(out.get_pixel(35, 10).0[0], 240);
    }

    #[test]
    fn collects_images_in_name_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.png", "a.JPG", "notes.txt", "c.tif"] {
            fs::write(dir.path().join(name), b"x").expect("write");
        }
        fs::create_dir(dir.path().join("sub.png")).expect("mkdir");
        let names: Vec<String> = collect_image_paths(dir.path())
            .expect("list")
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.png", "c.tif"]);
    }

    #[test]
    fn ensure_prefers_a_matching_cache_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CalibrationStore::new(dir.path());
        let cached = identity_params(false, 80, 40);
        store.save("desk", &cached).expect("save");

        let no_images: [PathBuf; 0] = [];
        let got = ensure_calibration(&store, "desk", &no_images, &CalibratorConfig::default(), false)
            .expect("cache hit");
        assert_eq!(got, cached);

        // a record with the other rotation is a miss; with no photos the calibration fails
        let err = ensure_calibration(&store, "desk", &no_images, &CalibratorConfig::default(), true)
            .unwrap_err();
        assert!(matches!(err, SessionError::Calibrate(_)));
    }

    #[test]
    fn bad_session_ids_fail_before_calibrating() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CalibrationStore::new(dir.path());
        let no_images: [PathBuf; 0] = [];
        let err = ensure_calibration(&store, "../x", &no_images, &CalibratorConfig::default(), false)
            .unwrap_err();
        assert!(matches!(err, SessionError::Store(_)));
    }
}
