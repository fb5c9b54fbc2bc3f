//! Per-view parameter blobs, one JSON number array per calibrated camera.
//!
//! Files are named after the base name of the camera image, so
//! `images/left.png` is stored as `left.json`. On load a file is paired with a
//! camera by comparing base names; files that match no camera are skipped.

use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use super::PersistenceError;
use crate::calibration::{CalibrationParams, ParamMap};
use crate::view::ViewLayout;

const PARAMS_EXTENSION: &str = "json";

/// Result of scanning a parameter directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterLoadReport {
    pub loaded: ParamMap,
    /// One [`PersistenceError::UnmatchedParameterFile`] per skipped file.
    pub skipped: Vec<PersistenceError>,
}

pub fn params_path(dir: &Path, base_name: &str) -> PathBuf {
    dir.join(format!("{base_name}.{PARAMS_EXTENSION}"))
}

/// Writes one file per calibrated camera and removes files of cameras that
/// are no longer calibrated.
pub fn save_params<P: AsRef<Path>>(
    dir: P,
    layout: &ViewLayout,
    params: &ParamMap,
) -> Result<(), PersistenceError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    for (view, info) in layout.cameras().iter().enumerate() {
        let path = params_path(dir, info.base_name());
        match params.get(&view) {
            Some(values) => fs::write(&path, serde_json::to_string(values)?)?,
            None if path.exists() => fs::remove_file(&path)?,
            None => {}
        }
    }

    info!("Saved parameters of {} views to {}", params.len(), dir.display());
    Ok(())
}

/// Loads every parameter file in `dir` that names a camera of `layout`.
///
/// A missing directory yields an empty report.
pub fn load_params<P: AsRef<Path>>(
    dir: P,
    layout: &ViewLayout,
) -> Result<ParameterLoadReport, PersistenceError> {
    let dir = dir.as_ref();
    let mut report = ParameterLoadReport::default();
    if !dir.is_dir() {
        return Ok(report);
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    paths.sort();

    for path in paths {
        let is_params = path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(PARAMS_EXTENSION));
        if !is_params {
            continue;
        }
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Some(view) = layout.camera_by_base_name(&file_name) else {
            warn!("Parameter file {file_name} does not match any view, skipping");
            report
                .skipped
                .push(PersistenceError::UnmatchedParameterFile(file_name));
            continue;
        };

        let text = fs::read_to_string(&path)?;
        let values: Vec<f64> = serde_json::from_str(&text).map_err(|e| {
            PersistenceError::LoadError(format!("{}: {e}", path.display()))
        })?;
        report.loaded.insert(view, CalibrationParams::new(values));
    }

    info!(
        "Loaded parameters of {} views from {}",
        report.loaded.len(),
        dir.display()
    );
    Ok(report)
}
