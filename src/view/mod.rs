//! Views: the camera images and the reference map that points are observed in.
//!
//! Cameras occupy indices `0..n` and the reference map is always index `n`.
//! Each view carries a fixed native pixel shape that is set when the view is
//! loaded and never changes afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Index of a camera (`0..n`) or of the reference map (`n`).
pub type View = usize;

/// Shapes of every view that has one, keyed by view index.
pub type ViewShapes = BTreeMap<View, ViewShape>;

/// Native pixel shape of a view: height, width and channel count.
///
/// Serialized as a `[height, width, channels]` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 3]", into = "[u32; 3]")]
pub struct ViewShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl ViewShape {
    pub fn new(height: u32, width: u32, channels: u32) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Reads the shape from an image header without decoding the pixels.
    ///
    /// The channel count is reported as 3, matching how views are displayed.
    pub fn from_image<P: AsRef<Path>>(path: P) -> Result<Self, image::ImageError> {
        let (width, height) = image::image_dimensions(path)?;
        Ok(Self::new(height, width, 3))
    }

    /// Returns true when a native pixel coordinate lies inside the view.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x < self.width as f64 && y < self.height as f64
    }
}

impl From<[u32; 3]> for ViewShape {
    fn from(value: [u32; 3]) -> Self {
        Self::new(value[0], value[1], value[2])
    }
}

impl From<ViewShape> for [u32; 3] {
    fn from(shape: ViewShape) -> Self {
        [shape.height, shape.width, shape.channels]
    }
}

/// A loaded view: its file name and native shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewInfo {
    pub name: String,
    pub shape: ViewShape,
}

impl ViewInfo {
    pub fn new(name: impl Into<String>, shape: ViewShape) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// File name without its extension, used to pair views with parameter files.
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }
}

/// Strips directories and the final extension from a file name.
pub fn base_name(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name)
}

/// The ordered set of cameras plus the reference map of one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewLayout {
    cameras: Vec<ViewInfo>,
    map: Option<ViewInfo>,
}

impl ViewLayout {
    pub fn new(cameras: Vec<ViewInfo>, map: Option<ViewInfo>) -> Self {
        Self { cameras, map }
    }

    /// Number of cameras, `n`.
    pub fn view_count(&self) -> usize {
        self.cameras.len()
    }

    /// Index of the reference map, always `n`.
    pub fn map_index(&self) -> View {
        self.cameras.len()
    }

    pub fn is_camera(&self, view: View) -> bool {
        view < self.cameras.len()
    }

    /// True for cameras, and for the map index when a map is loaded.
    pub fn contains(&self, view: View) -> bool {
        self.get(view).is_some()
    }

    pub fn cameras(&self) -> &[ViewInfo] {
        &self.cameras
    }

    pub fn map(&self) -> Option<&ViewInfo> {
        self.map.as_ref()
    }

    pub fn get(&self, view: View) -> Option<&ViewInfo> {
        if view == self.map_index() {
            self.map.as_ref()
        } else {
            self.cameras.get(view)
        }
    }

    /// Shapes of all loaded views, including the map when present.
    pub fn shapes(&self) -> ViewShapes {
        let mut shapes: ViewShapes = self
            .cameras
            .iter()
            .enumerate()
            .map(|(idx, info)| (idx, info.shape))
            .collect();
        if let Some(map) = &self.map {
            shapes.insert(self.map_index(), map.shape);
        }
        shapes
    }

    /// Finds the camera whose base name equals `base` (extension-insensitive).
    pub fn camera_by_base_name(&self, base: &str) -> Option<View> {
        self.cameras
            .iter()
            .position(|info| info.base_name() == base_name(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ViewLayout {
        ViewLayout::new(
            vec![
                ViewInfo::new("left.png", ViewShape::new(480, 640, 3)),
                ViewInfo::new("right.jpg", ViewShape::new(720, 1280, 3)),
            ],
            Some(ViewInfo::new("minimap.png", ViewShape::new(600, 800, 3))),
        )
    }

    #[test]
    fn test_map_is_last_index() {
        let layout = layout();
        assert_eq!(layout.view_count(), 2);
        assert_eq!(layout.map_index(), 2);
        assert!(layout.is_camera(1));
        assert!(!layout.is_camera(2));
        assert!(layout.contains(2));
        assert!(!layout.contains(3));

        let no_map = ViewLayout::new(layout.cameras().to_vec(), None);
        assert!(no_map.contains(1));
        assert!(!no_map.contains(2));
        assert_eq!(layout.get(2).map(|v| v.name.as_str()), Some("minimap.png"));
    }

    #[test]
    fn test_shapes_include_map() {
        let shapes = layout().shapes();
        assert_eq!(shapes.len(), 3);
        assert_eq!(shapes[&1], ViewShape::new(720, 1280, 3));
        assert_eq!(shapes[&2].width, 800);
    }

    #[test]
    fn test_camera_lookup_ignores_extension() {
        let layout = layout();
        assert_eq!(layout.camera_by_base_name("right.json"), Some(1));
        assert_eq!(layout.camera_by_base_name("left"), Some(0));
        assert_eq!(layout.camera_by_base_name("minimap.json"), None);
    }

    #[test]
    fn test_shape_serializes_as_triple() {
        let shape = ViewShape::new(1080, 1920, 3);
        let yaml = serde_yaml::to_string(&shape).unwrap();
        let back: ViewShape = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, shape);
        assert!(shape.contains(1919.0, 0.0));
        assert!(!shape.contains(1920.0, 0.0));
    }
}
