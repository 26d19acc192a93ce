//! Session-keyed calibration cache.
//!
//! Record layout, little-endian:
//!
//! | field | bytes |
//! |---|---|
//! | magic `TCAL` | 4 |
//! | format version (`u16`) | 2 |
//! | rotate (`u8`, 0 or 1) | 1 |
//! | camera matrix, row-major `f64` | 72 |
//! | distortion count (`u32`) then `f64` coefficients | 4 + 8n |
//! | optimal camera matrix, row-major `f64` | 72 |
//! | valid ROI `x, y, w, h` (`i32`) | 16 |

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use nalgebra::Matrix3;
use tablecam_core::Distortion;

use crate::{CalibrationParameters, Roi, StoreError};

pub const RECORD_MAGIC: [u8; 4] = *b"TCAL";
pub const RECORD_VERSION: u16 = 1;
pub const RECORD_EXTENSION: &str = "tcal";

/// Distinguishes temporary files of concurrent saves within one process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn put_matrix(out: &mut Vec<u8>, m: &Matrix3<f64>) {
    for r in 0..3 {
        for c in 0..3 {
            out.extend_from_slice(&m[(r, c)].to_le_bytes());
        }
    }
}

/// Serialize parameters into the versioned binary record.
pub fn encode(params: &CalibrationParameters) -> Vec<u8> {
    let coeffs = params.distortion_coeffs();
    let mut out = Vec::with_capacity(4 + 2 + 1 + 72 + 4 + 8 * coeffs.len() + 72 + 16);
    out.extend_from_slice(&RECORD_MAGIC);
    out.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    out.push(u8::from(params.rotate));
    put_matrix(&mut out, &params.camera_matrix);
    out.extend_from_slice(&(coeffs.len() as u32).to_le_bytes());
    for c in &coeffs {
        out.extend_from_slice(&c.to_le_bytes());
    }
    put_matrix(&mut out, &params.optimal_camera_matrix);
    let roi = params.valid_roi;
    for v in [roi.x, roi.y, roi.width, roi.height] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self, what: &str) -> Result<[u8; N], StoreError> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| StoreError::Corrupt(format!("truncated at {what}")))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn f64(&mut self, what: &str) -> Result<f64, StoreError> {
        Ok(f64::from_le_bytes(self.take::<8>(what)?))
    }

    fn matrix(&mut self, what: &str) -> Result<Matrix3<f64>, StoreError> {
        let mut m = Matrix3::zeros();
        for r in 0..3 {
            for c in 0..3 {
                m[(r, c)] = self.f64(what)?;
            }
        }
        Ok(m)
    }
}

/// Parse a record; any shape or value problem is [`StoreError::Corrupt`].
pub fn decode(bytes: &[u8]) -> Result<CalibrationParameters, StoreError> {
    let mut rd = Reader { buf: bytes, pos: 0 };
    if rd.take::<4>("magic")? != RECORD_MAGIC {
        return Err(StoreError::Corrupt("bad magic".into()));
    }
    let version = u16::from_le_bytes(rd.take::<2>("version")?);
    if version != RECORD_VERSION {
        return Err(StoreError::Corrupt(format!("unsupported version {version}")));
    }
    let rotate = match rd.take::<1>("rotate")?[0] {
        0 => false,
        1 => true,
        v => return Err(StoreError::Corrupt(format!("rotate flag {v}"))),
    };
    let camera_matrix = rd.matrix("camera matrix")?;

    let count = u32::from_le_bytes(rd.take::<4>("distortion count")?) as usize;
    if !matches!(count, 4 | 5 | 8) {
        return Err(StoreError::Corrupt(format!("{count} distortion coefficients")));
    }
    let coeffs = (0..count)
        .map(|_| rd.f64("distortion"))
        .collect::<Result<Vec<_>, _>>()?;
    let distortion =
        Distortion::from_coeffs(&coeffs).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let optimal_camera_matrix = rd.matrix("optimal matrix")?;
    let mut roi = [0i32; 4];
    for v in roi.iter_mut() {
        *v = i32::from_le_bytes(rd.take::<4>("roi")?);
    }
    if rd.pos != bytes.len() {
        return Err(StoreError::Corrupt(format!(
            "{} trailing bytes",
            bytes.len() - rd.pos
        )));
    }

    let params = CalibrationParameters {
        rotate,
        camera_matrix,
        distortion,
        optimal_camera_matrix,
        valid_roi: Roi::new(roi[0], roi[1], roi[2], roi[3]),
    };
    if !params.is_valid() {
        return Err(StoreError::Corrupt("degenerate camera matrix".into()));
    }
    Ok(params)
}

/// Session ids become file names, so only a conservative alphabet is allowed.
pub fn validate_session_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(id.to_string()))
    }
}

/// One binary record per session under a cache directory.
#[derive(Clone, Debug)]
pub struct CalibrationStore {
    dir: PathBuf,
}

impl CalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session: &str) -> Result<PathBuf, StoreError> {
        validate_session_id(session)?;
        Ok(self.dir.join(format!("{session}.{RECORD_EXTENSION}")))
    }

    /// Cached parameters, or `None` for a missing, unreadable or corrupt record.
    pub fn load(&self, session: &str) -> Option<CalibrationParameters> {
        let path = match self.path_for(session) {
            Ok(p) => p,
            Err(e) => {
                warn!("{e}");
                return None;
            }
        };
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no cached calibration at {}", path.display());
                return None;
            }
            Err(e) => {
                warn!("cannot read {}: {}", path.display(), e);
                return None;
            }
        };
        match decode(&bytes) {
            Ok(params) => {
                info!("loaded calibration for session {session:?}");
                Some(params)
            }
            Err(e) => {
                warn!("ignoring {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Write the record atomically: a temporary sibling is renamed over the
    /// target. The temporary file never outlives a failed save.
    pub fn save(&self, session: &str, params: &CalibrationParameters) -> Result<(), StoreError> {
        let path = self.path_for(session)?;
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!(
            ".{session}.{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = write_synced(&tmp, &encode(params)).and_then(|()| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        info!("saved calibration for session {session:?} to {}", path.display());
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
