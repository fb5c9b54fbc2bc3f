//! Coordinate normalization, grid sampling and error statistics.

use log::debug;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::calibration::CalibrationError;
use crate::correspondence::PointData;
use crate::view::{View, ViewShape, ViewShapes};

pub mod homography;

/// Maps native pixel coordinates into a view-shape-independent space.
pub trait Normalizer {
    /// Normalizes one native coordinate of `view`.
    fn normalize_point(
        &self,
        view: View,
        point: &Vector2<f64>,
        shapes: &ViewShapes,
    ) -> Result<Vector2<f64>, CalibrationError>;

    /// Maps a single normalized coordinate of `view` back to native pixels.
    fn denormalize(
        &self,
        view: View,
        point: &Vector2<f64>,
        shapes: &ViewShapes,
    ) -> Result<Vector2<f64>, CalibrationError>;

    /// Normalizes every stored coordinate, mirroring the layout of `point_data`.
    fn normalize(
        &self,
        point_data: &PointData,
        shapes: &ViewShapes,
    ) -> Result<PointData, CalibrationError> {
        let mut normalized = PointData::new();
        for (view, view_points) in point_data {
            let entry = normalized.entry(*view).or_default();
            for (label, point) in view_points {
                entry.insert(*label, self.normalize_point(*view, point, shapes)?);
            }
        }
        debug!("Normalized points of {} views", normalized.len());
        Ok(normalized)
    }
}

/// Centers each view on its image center and scales by half its longer side.
///
/// `x_n = (x - w/2) / s`, `y_n = (y - h/2) / s` with `s = max(w, h) / 2`, so
/// the longer image axis spans `[-1, 1]` and the aspect ratio is preserved.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeNormalizer;

impl ShapeNormalizer {
    fn frame(shape: &ViewShape) -> (Vector2<f64>, f64) {
        let center = Vector2::new(shape.width as f64 / 2.0, shape.height as f64 / 2.0);
        let scale = (shape.width.max(shape.height) as f64 / 2.0).max(1.0);
        (center, scale)
    }

    pub fn normalize_with(shape: &ViewShape, point: &Vector2<f64>) -> Vector2<f64> {
        let (center, scale) = Self::frame(shape);
        (point - center) / scale
    }

    pub fn denormalize_with(shape: &ViewShape, point: &Vector2<f64>) -> Vector2<f64> {
        let (center, scale) = Self::frame(shape);
        point * scale + center
    }
}

impl Normalizer for ShapeNormalizer {
    fn normalize_point(
        &self,
        view: View,
        point: &Vector2<f64>,
        shapes: &ViewShapes,
    ) -> Result<Vector2<f64>, CalibrationError> {
        let shape = shapes.get(&view).ok_or(CalibrationError::MissingShape(view))?;
        Ok(Self::normalize_with(shape, point))
    }

    fn denormalize(
        &self,
        view: View,
        point: &Vector2<f64>,
        shapes: &ViewShapes,
    ) -> Result<Vector2<f64>, CalibrationError> {
        let shape = shapes.get(&view).ok_or(CalibrationError::MissingShape(view))?;
        Ok(Self::denormalize_with(shape, point))
    }
}

/// Generates a grid of roughly `n` points evenly spread over an image, keeping
/// `offset` pixels away from every border.
pub fn sample_points(width: f64, height: f64, n: usize, offset: f64) -> Vec<Vector2<f64>> {
    let inner_width = (width - 2.0 * offset).max(1.0);
    let inner_height = (height - 2.0 * offset).max(1.0);

    let num_cells_x = ((n as f64 * (inner_width / inner_height)).sqrt().round() as usize).max(1);
    let num_cells_y = ((n as f64 * (inner_height / inner_width)).sqrt().round() as usize).max(1);

    let cell_width = inner_width / num_cells_x as f64;
    let cell_height = inner_height / num_cells_y as f64;

    let mut points = Vec::with_capacity(num_cells_x * num_cells_y);
    for i in 0..num_cells_y {
        for j in 0..num_cells_x {
            let x = offset + (j as f64 + 0.5) * cell_width;
            let y = offset + (i as f64 + 0.5) * cell_height;
            points.push(Vector2::new(x, y));
        }
    }
    points
}

/// Summary statistics of a set of point distances.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
    pub count: usize,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ n: {}, rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.count, self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl ProjectionError {
    /// Computes the statistics of `errors`; `None` when there are none.
    pub fn from_errors(errors: &[f64]) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;

        let variance: f64 = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();

        let sum_squared: f64 = errors.iter().map(|x| x.powi(2)).sum::<f64>();
        let rmse = (sum_squared / n).sqrt();

        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted_errors = errors.to_vec();
        sorted_errors.sort_by(|a, b| a.total_cmp(b));
        let median = if sorted_errors.len() % 2 == 0 {
            let mid = sorted_errors.len() / 2;
            (sorted_errors[mid - 1] + sorted_errors[mid]) / 2.0
        } else {
            sorted_errors[sorted_errors.len() / 2]
        };

        Some(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev,
            median,
            count: errors.len(),
        })
    }
}
