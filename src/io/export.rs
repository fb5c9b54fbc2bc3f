//! CSV export of all correspondences.

use log::info;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

use super::PersistenceError;
use crate::correspondence::{CorrespondenceStore, Label};
use crate::view::View;

#[derive(Debug, Serialize)]
struct CorrespondenceRow {
    view: View,
    label: Label,
    x: f64,
    y: f64,
    floor: bool,
}

/// Writes one `view,label,x,y,floor` row per stored point.
pub fn write_csv<W: Write>(writer: W, store: &CorrespondenceStore) -> Result<usize, PersistenceError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    let mut rows = 0;
    for (view, points) in store.point_data() {
        for (label, point) in points {
            csv_writer.serialize(CorrespondenceRow {
                view: *view,
                label: *label,
                x: point.x,
                y: point.y,
                floor: store.is_floor(*label),
            })?;
            rows += 1;
        }
    }
    csv_writer.flush()?;
    Ok(rows)
}

pub fn export_csv<P: AsRef<Path>>(
    path: P,
    store: &CorrespondenceStore,
) -> Result<usize, PersistenceError> {
    let path = path.as_ref();
    let file = std::fs::File::create(path)?;
    let rows = write_csv(file, store)?;
    info!("Exported {rows} correspondences to {}", path.display());
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    #[test]
    fn test_csv_rows() {
        let mut store = CorrespondenceStore::new();
        store.set_point(0, 1, Vector2::new(1.5, 2.0));
        store.set_point(2, 1, Vector2::new(3.0, 4.25));
        store.set_point(0, 4, Vector2::new(7.0, 8.0));
        store.toggle_floor(1);

        let mut buffer = Vec::new();
        let rows = write_csv(&mut buffer, &store).unwrap();
        assert_eq!(rows, 3);

        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "view,label,x,y,floor",
                "0,1,1.5,2.0,true",
                "0,4,7.0,8.0,false",
                "2,1,3.0,4.25,true",
            ]
        );
    }
}
