//! The point record: point data and floor points, persisted together.
//!
//! On disk the record is a JSON object
//! `{"point_data": {"<view>": {"<label>": [x, y]}}, "floor_points": [..]}`.
//! Records written before floor points existed hold the point data mapping at
//! the top level and load with an empty floor set.

use log::{debug, info};
use nalgebra::Vector2;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use super::PersistenceError;
use crate::correspondence::{CorrespondenceStore, Label, PointData, ViewPoints};
use crate::view::View;

const POINT_DATA_KEY: &str = "point_data";
const FLOOR_POINTS_KEY: &str = "floor_points";

#[derive(Serialize)]
struct RecordFile<'a> {
    point_data: BTreeMap<String, BTreeMap<String, [f64; 2]>>,
    floor_points: &'a BTreeSet<Label>,
}

/// Serializes the whole store as one JSON document.
pub fn to_json(store: &CorrespondenceStore) -> Result<String, PersistenceError> {
    let point_data = store
        .point_data()
        .iter()
        .map(|(view, points)| {
            let points = points
                .iter()
                .map(|(label, p)| (label.to_string(), [p.x, p.y]))
                .collect();
            (view.to_string(), points)
        })
        .collect();
    let record = RecordFile {
        point_data,
        floor_points: store.floor_points(),
    };
    Ok(serde_json::to_string_pretty(&record)?)
}

/// Parses a record, accepting both the current and the legacy layout.
pub fn from_json(text: &str) -> Result<CorrespondenceStore, PersistenceError> {
    let root: Value = serde_json::from_str(text)?;
    let Value::Object(root) = root else {
        return Err(PersistenceError::LoadError(
            "point record must be a JSON object".to_string(),
        ));
    };

    let (point_data, floor_points) = match root.get(POINT_DATA_KEY) {
        Some(point_data) => {
            let floor_points = match root.get(FLOOR_POINTS_KEY) {
                Some(floor) => parse_floor_points(floor)?,
                None => BTreeSet::new(),
            };
            (parse_point_data(as_object(point_data, POINT_DATA_KEY)?)?, floor_points)
        }
        None => {
            debug!("Loading legacy point record without floor points");
            (parse_point_data(&root)?, BTreeSet::new())
        }
    };

    Ok(CorrespondenceStore::from_parts(point_data, floor_points))
}

/// Writes the record next to `path` and renames it into place, so point data
/// and floor points are replaced together.
///
/// # Arguments
///
/// * `path` - Destination of the record; `<path>.tmp` is used as scratch file.
/// * `store` - Points and floor labels to write.
///
/// # Returns
///
/// * `Result<(), PersistenceError>` - `IOError` when writing or renaming fails.
pub fn save_record<P: AsRef<Path>>(
    path: P,
    store: &CorrespondenceStore,
) -> Result<(), PersistenceError> {
    let path = path.as_ref();
    let json = to_json(store)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = Path::new(&tmp_name);
    fs::write(tmp, json)?;
    fs::rename(tmp, path)?;

    info!(
        "Saved {} labels ({} on the floor) to {}",
        store.labels().len(),
        store.floor_points().len(),
        path.display()
    );
    Ok(())
}

pub fn load_record<P: AsRef<Path>>(path: P) -> Result<CorrespondenceStore, PersistenceError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| PersistenceError::LoadError(format!("{}: {e}", path.display())))?;
    let store = from_json(&text)?;
    info!(
        "Loaded {} labels from {}",
        store.labels().len(),
        path.display()
    );
    Ok(store)
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, PersistenceError> {
    value
        .as_object()
        .ok_or_else(|| PersistenceError::LoadError(format!("{what} must be a JSON object")))
}

fn parse_point_data(raw: &Map<String, Value>) -> Result<PointData, PersistenceError> {
    let mut point_data = PointData::new();
    for (view_key, points) in raw {
        let view: View = coerce_key(view_key)?;
        let mut view_points = ViewPoints::new();
        for (label_key, coord) in as_object(points, &format!("points of view {view}"))? {
            let label: Label = coerce_key(label_key)?;
            view_points.insert(label, parse_coord(coord, view, label)?);
        }
        point_data.insert(view, view_points);
    }
    Ok(point_data)
}

fn parse_coord(value: &Value, view: View, label: Label) -> Result<Vector2<f64>, PersistenceError> {
    let invalid = || {
        PersistenceError::LoadError(format!(
            "point {label} of view {view} must be a pair of finite numbers"
        ))
    };
    let coords = value.as_array().ok_or_else(invalid)?;
    let [x, y] = coords.as_slice() else {
        return Err(invalid());
    };
    let x = x.as_f64().filter(|v| v.is_finite()).ok_or_else(invalid)?;
    let y = y.as_f64().filter(|v| v.is_finite()).ok_or_else(invalid)?;
    Ok(Vector2::new(x, y))
}

fn parse_floor_points(value: &Value) -> Result<BTreeSet<Label>, PersistenceError> {
    let items = value.as_array().ok_or_else(|| {
        PersistenceError::LoadError(format!("{FLOOR_POINTS_KEY} must be a JSON array"))
    })?;
    items
        .iter()
        .map(|item| match item {
            Value::Number(n) => match n.as_u64() {
                Some(v) => narrow(v, &n.to_string()),
                None => integral(n.as_f64(), &n.to_string()),
            },
            Value::String(s) => coerce_key(s),
            other => Err(PersistenceError::LoadError(format!(
                "floor point {other} is not an integer"
            ))),
        })
        .collect()
}

/// Parses an integer key; integral floats such as `"3.0"` are accepted.
fn coerce_key<T: TryFrom<u64>>(key: &str) -> Result<T, PersistenceError> {
    let key = key.trim();
    match key.parse::<u64>() {
        Ok(v) => narrow(v, key),
        Err(_) => integral(key.parse::<f64>().ok(), key),
    }
}

fn integral<T: TryFrom<u64>>(value: Option<f64>, raw: &str) -> Result<T, PersistenceError> {
    match value {
        Some(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64 => {
            narrow(v as u64, raw)
        }
        _ => Err(PersistenceError::LoadError(format!(
            "key {raw:?} is not a non-negative integer"
        ))),
    }
}

fn narrow<T: TryFrom<u64>>(value: u64, raw: &str) -> Result<T, PersistenceError> {
    T::try_from(value)
        .map_err(|_| PersistenceError::LoadError(format!("key {raw:?} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use approx::assert_relative_eq;

    fn sample_store() -> CorrespondenceStore {
        let mut store = CorrespondenceStore::new();
        store.set_point(0, 0, Vector2::new(10.5, 20.25));
        store.set_point(1, 0, Vector2::new(11.0, 21.0));
        store.set_point(2, 3, Vector2::new(100.0, 200.0));
        store.toggle_floor(0);
        store
    }

    #[test]
    fn test_save_then_load_file() {
        let tmp_dir = tempdir().unwrap();
        let dir = tmp_dir.path();
        let path = dir.join("cam.json");
        let store = sample_store();

        save_record(&path, &store).unwrap();
        assert!(!dir.join("cam.json.tmp").exists());

        let loaded = load_record(&path).unwrap();
        assert_eq!(loaded, store);
        assert!(loaded.is_floor(0));
    }

    #[test]
    fn test_string_keys_on_disk() {
        let json = to_json(&sample_store()).unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["point_data"]["2"]["3"][0], 100.0);
        assert_eq!(value["floor_points"], serde_json::json!([0]));
    }

    #[test]
    fn test_legacy_record() {
        let legacy = r#"{"0": {"1": [1.0, 2.0], "2": [3.0, 4.0]}, "3": {"1": [5.0, 6.0]}}"#;
        let store = from_json(legacy).unwrap();
        assert!(store.floor_points().is_empty());
        assert_eq!(store.labels(), [1, 2].into_iter().collect());
        assert_relative_eq!(store.point(3, 1).unwrap().y, 6.0);
    }

    #[test]
    fn test_legacy_record_resaved_in_current_layout() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("cam.json");
        fs::write(&path, r#"{"0": {"1": [1.5, 2.0]}, "2": {"1": [3.0, 4.0], "4": [5.0, 6.0]}}"#)
            .unwrap();

        let legacy = load_record(&path).unwrap();
        save_record(&path, &legacy).unwrap();

        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value.get("point_data").is_some());
        assert_eq!(value["floor_points"], serde_json::json!([]));
        assert_eq!(value["point_data"]["2"]["4"][1], 6.0);

        let reloaded = load_record(&path).unwrap();
        assert_eq!(reloaded, legacy);
        assert_eq!(reloaded.labels(), [1, 4].into_iter().collect());
    }

    #[test]
    fn test_integral_float_keys() {
        let json = r#"{"point_data": {"1.0": {"4.0": [1, 2]}}, "floor_points": [4.0]}"#;
        let store = from_json(json).unwrap();
        assert_eq!(store.point(1, 4), Some(Vector2::new(1.0, 2.0)));
        assert!(store.is_floor(4));
    }

    #[test]
    fn test_orphan_floor_points_dropped() {
        let json = r#"{"point_data": {"0": {"1": [1, 2]}}, "floor_points": [1, 9]}"#;
        let store = from_json(json).unwrap();
        assert_eq!(store.floor_points(), &BTreeSet::from([1]));
    }

    #[test]
    fn test_invalid_records() {
        for bad in [
            r#"{"point_data": {"a": {}}}"#,
            r#"{"point_data": {"0": {"1.5": [1, 2]}}}"#,
            r#"{"point_data": {"0": {"1": [1]}}}"#,
            r#"{"point_data": {"0": {"1": [1, 2]}}, "floor_points": [-1]}"#,
            r#"[1, 2]"#,
        ] {
            assert!(
                matches!(from_json(bad), Err(PersistenceError::LoadError(_))),
                "{bad}"
            );
        }
        assert!(matches!(
            from_json("not json"),
            Err(PersistenceError::JsonError(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let tmp_dir = tempdir().unwrap();
        let dir = tmp_dir.path();
        assert!(matches!(
            load_record(dir.join("absent.json")),
            Err(PersistenceError::LoadError(_))
        ));
    }
}
