use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tablecam_calib::CalibratorConfig;

use crate::{ConfigError, PlaneParams};

/// Everything the pipeline needs, loadable from one JSON file. Missing
/// fields take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub calibrator: CalibratorConfig,
    pub plane: PlaneParams,
    /// Rotate frames 90 degrees clockwise before any processing.
    pub rotate: bool,
    /// Directory holding `<session>.tcal` records.
    pub cache_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            calibrator: CalibratorConfig::default(),
            plane: PlaneParams::default(),
            rotate: false,
            cache_dir: PathBuf::from("calibration-cache"),
        }
    }
}

impl PipelineConfig {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
