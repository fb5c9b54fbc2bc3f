//! Session configuration loaded from `session.yaml`.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::PersistenceError;
use crate::view::{ViewInfo, ViewLayout, ViewShape};

pub const CONFIG_FILE: &str = "session.yaml";

fn default_record_file() -> String {
    "cam.json".to_string()
}

/// One view of the session, identified by an image path or by a name.
///
/// When `shape` is omitted it is read from the image header at `path`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<ViewShape>,
}

impl ViewSpec {
    pub fn named(name: impl Into<String>, shape: ViewShape) -> Self {
        Self {
            path: None,
            name: Some(name.into()),
            shape: Some(shape),
        }
    }

    /// Resolves name and shape, reading image headers relative to `base_dir`.
    pub fn resolve(&self, base_dir: &Path) -> Result<ViewInfo, PersistenceError> {
        let name = match (&self.name, &self.path) {
            (Some(name), _) => name.clone(),
            (None, Some(path)) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    PersistenceError::LoadError(format!("{} has no file name", path.display()))
                })?,
            (None, None) => {
                return Err(PersistenceError::LoadError(
                    "view needs a path or a name".to_string(),
                ))
            }
        };

        let shape = match (self.shape, &self.path) {
            (Some(shape), _) => shape,
            (None, Some(path)) => {
                let full = base_dir.join(path);
                debug!("Reading shape of {name} from {}", full.display());
                ViewShape::from_image(full)?
            }
            (None, None) => {
                return Err(PersistenceError::LoadError(format!(
                    "view {name} needs a shape or an image path"
                )))
            }
        };

        Ok(ViewInfo::new(name, shape))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Minimum shared points for pair and single-view solves.
    pub min_correspondences: usize,
    /// Grid size of the ground preview.
    pub preview_points: usize,
    /// Pixel margin of the preview grid.
    pub preview_offset: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            min_correspondences: 4,
            preview_points: 50,
            preview_offset: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Cameras in index order.
    pub views: Vec<ViewSpec>,
    #[serde(default)]
    pub map: Option<ViewSpec>,
    #[serde(default)]
    pub solver: SolverSettings,
    #[serde(default = "default_record_file")]
    pub record_file: String,
}

impl SessionConfig {
    pub fn new(views: Vec<ViewSpec>, map: Option<ViewSpec>) -> Self {
        Self {
            views,
            map,
            solver: SolverSettings::default(),
            record_file: default_record_file(),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, PersistenceError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| PersistenceError::LoadError(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    pub fn save_to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), PersistenceError> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Builds the view layout, resolving image paths relative to `base_dir`.
    pub fn layout(&self, base_dir: &Path) -> Result<ViewLayout, PersistenceError> {
        let cameras = self
            .views
            .iter()
            .map(|spec| spec.resolve(base_dir))
            .collect::<Result<Vec<_>, _>>()?;
        let map = self
            .map
            .as_ref()
            .map(|spec| spec.resolve(base_dir))
            .transpose()?;
        Ok(ViewLayout::new(cameras, map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
views:
  - name: left.png
    shape: [480, 640, 3]
  - name: right.png
    shape: [720, 1280, 3]
map:
  name: minimap.png
  shape: [600, 800, 3]
solver:
  min_correspondences: 6
"#;
        let config = SessionConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.solver.min_correspondences, 6);
        assert_eq!(config.solver.preview_points, 50);
        assert_relative_eq!(config.solver.preview_offset, 10.0);
        assert_eq!(config.record_file, "cam.json");

        let layout = config.layout(Path::new(".")).unwrap();
        assert_eq!(layout.view_count(), 2);
        assert_eq!(layout.map_index(), 2);
        assert_eq!(layout.get(1).unwrap().shape, ViewShape::new(720, 1280, 3));
        assert_eq!(layout.map().unwrap().base_name(), "minimap");
    }

    #[test]
    fn test_shape_from_image_header() {
        let tmp_dir = tempdir().unwrap();
        let dir = tmp_dir.path();
        image::RgbImage::new(32, 16)
            .save(dir.join("cam.png"))
            .unwrap();

        let spec = ViewSpec {
            path: Some(PathBuf::from("cam.png")),
            ..ViewSpec::default()
        };
        let info = spec.resolve(dir).unwrap();
        assert_eq!(info.name, "cam.png");
        assert_eq!(info.shape, ViewShape::new(16, 32, 3));
    }

    #[test]
    fn test_unresolvable_views() {
        let tmp_dir = tempdir().unwrap();
        let dir = tmp_dir.path();
        assert!(matches!(
            ViewSpec::default().resolve(dir),
            Err(PersistenceError::LoadError(_))
        ));
        let shapeless = ViewSpec {
            name: Some("x.png".to_string()),
            ..ViewSpec::default()
        };
        assert!(matches!(
            shapeless.resolve(dir),
            Err(PersistenceError::LoadError(_))
        ));
        let missing_image = ViewSpec {
            path: Some(PathBuf::from("absent.png")),
            ..ViewSpec::default()
        };
        assert!(matches!(
            missing_image.resolve(dir),
            Err(PersistenceError::ImageError(_))
        ));
    }

    #[test]
    fn test_yaml_round_trip() {
        let tmp_dir = tempdir().unwrap();
        let dir = tmp_dir.path();
        let config = SessionConfig::new(
            vec![ViewSpec::named("a.png", ViewShape::new(10, 20, 3))],
            Some(ViewSpec::named("map.png", ViewShape::new(30, 40, 3))),
        );
        let path = dir.join(CONFIG_FILE);
        config.save_to_yaml(&path).unwrap();
        assert_eq!(SessionConfig::load_from_yaml(&path).unwrap(), config);
    }
}
