//! Persistence of calibration sessions.
//!
//! A session directory holds:
//! - `session.yaml`: the [`SessionConfig`] naming cameras and the reference map,
//! - the point record (`cam.json` by default),
//! - `params/<view base name>.json`: one parameter blob per calibrated camera.

use crate::view::ViewLayout;

pub mod config;
pub mod export;
pub mod params;
pub mod record;
pub mod session;

pub use config::{SessionConfig, SolverSettings, ViewSpec};
pub use params::ParameterLoadReport;
pub use session::Session;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("Failed to load: {0}")]
    LoadError(String),
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("JSON Error: {0}")]
    JsonError(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("CSV Error: {0}")]
    CsvError(String),
    #[error("Image Error: {0}")]
    ImageError(String),
    #[error("Parameter file {0} matches no view")]
    UnmatchedParameterFile(String),
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::IOError(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for PersistenceError {
    fn from(err: serde_yaml::Error) -> Self {
        PersistenceError::YamlError(err.to_string())
    }
}

impl From<csv::Error> for PersistenceError {
    fn from(err: csv::Error) -> Self {
        PersistenceError::CsvError(err.to_string())
    }
}

impl From<image::ImageError> for PersistenceError {
    fn from(err: image::ImageError) -> Self {
        PersistenceError::ImageError(err.to_string())
    }
}

/// Folder name for a session: the base names of all camera images followed
/// by the map image, joined with `_`.
pub fn session_folder_name(layout: &ViewLayout) -> String {
    layout
        .cameras()
        .iter()
        .chain(layout.map())
        .map(|info| info.base_name())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{ViewInfo, ViewShape};

    #[test]
    fn test_session_folder_name() {
        let shape = ViewShape::new(10, 10, 3);
        let layout = ViewLayout::new(
            vec![
                ViewInfo::new("images/left.png", shape),
                ViewInfo::new("right.jpg", shape),
            ],
            Some(ViewInfo::new("minimap.png", shape)),
        );
        assert_eq!(session_folder_name(&layout), "left_right_minimap");

        let no_map = ViewLayout::new(vec![ViewInfo::new("a.png", shape)], None);
        assert_eq!(session_folder_name(&no_map), "a");
    }
}
