//! Ground-plane homography solver.
//!
//! Every camera is described by the homography that takes its normalized
//! pixel coordinates onto the normalized reference map. Linear estimates come
//! from the normalized DLT and are then refined with Levenberg-Marquardt.

use log::{debug, info};
use nalgebra::{Matrix3, Vector2};
use std::collections::{BTreeMap, BTreeSet};

use super::refine::refine_homographies;
use super::{is_planar, GroundProjection, Solver};
use crate::calibration::{AnchorMap, CalibrationError, CalibrationParams, ParamMap};
use crate::correspondence::{Label, PointData, ViewPoints};
use crate::geometry::homography::{
    apply, estimate_homography, from_params, to_params, MIN_HOMOGRAPHY_POINTS,
};
use crate::view::View;

/// Planar homography implementation of [`Solver`].
#[derive(Debug, Clone)]
pub struct PlanarHomographySolver {
    /// Minimum number of correspondences a linear estimate may start from.
    pub min_correspondences: usize,
    /// Run the non-linear refinement after the linear estimate.
    pub refine: bool,
}

impl Default for PlanarHomographySolver {
    fn default() -> Self {
        Self {
            min_correspondences: MIN_HOMOGRAPHY_POINTS,
            refine: true,
        }
    }
}

impl PlanarHomographySolver {
    pub fn new(min_correspondences: usize) -> Self {
        Self {
            min_correspondences: min_correspondences.max(MIN_HOMOGRAPHY_POINTS),
            refine: true,
        }
    }

    fn check_count(&self, count: usize, what: &str) -> Result<(), CalibrationError> {
        if count < self.min_correspondences {
            return Err(CalibrationError::InsufficientCorrespondence(format!(
                "{count} {what}, need at least {}",
                self.min_correspondences
            )));
        }
        Ok(())
    }

    /// Linear fit of `view` against the given ground coordinates.
    fn fit(
        &self,
        points: &ViewPoints,
        ground: &BTreeMap<Label, Vector2<f64>>,
        labels: &BTreeSet<Label>,
    ) -> Result<Matrix3<f64>, CalibrationError> {
        let (src, dst): (Vec<_>, Vec<_>) = labels
            .iter()
            .filter_map(|label| Some((*points.get(label)?, *ground.get(label)?)))
            .unzip();
        estimate_homography(&src, &dst)
    }
}

fn view_points<'a>(data: &'a PointData, view: View) -> Result<&'a ViewPoints, CalibrationError> {
    data.get(&view).ok_or_else(|| {
        CalibrationError::InsufficientCorrespondence(format!("view {view} has no points"))
    })
}

impl Solver for PlanarHomographySolver {
    fn calibrate_pair(
        &self,
        data: &PointData,
        view_a: View,
        view_b: View,
        floor_points: &BTreeSet<Label>,
        view_count: usize,
    ) -> Result<ParamMap, CalibrationError> {
        let map_view = view_count;
        let points_a = view_points(data, view_a)?;
        let points_b = view_points(data, view_b)?;
        let map = view_points(data, map_view)?;

        let shared: BTreeSet<Label> = points_a
            .keys()
            .filter(|label| points_b.contains_key(label) && is_planar(**label, floor_points))
            .copied()
            .collect();
        self.check_count(shared.len(), "shared planar correspondences")?;

        let grounded: BTreeSet<Label> = shared
            .iter()
            .filter(|label| map.contains_key(label))
            .copied()
            .collect();
        self.check_count(grounded.len(), "shared correspondences seen by the map")?;

        let mut initial = BTreeMap::new();
        initial.insert(view_a, self.fit(points_a, map, &grounded)?);
        initial.insert(view_b, self.fit(points_b, map, &grounded)?);
        debug!(
            "Pair {view_a}/{view_b}: {} shared, {} on the map",
            shared.len(),
            grounded.len()
        );

        let solved = if self.refine {
            refine_homographies(&initial, data, map_view, floor_points)?
        } else {
            initial
        };

        info!("Calibrated pair {view_a}/{view_b}");
        Ok(solved.iter().map(|(view, h)| (*view, to_params(h))).collect())
    }

    fn calibrate_joint(
        &self,
        current: &ParamMap,
        data: &PointData,
        view_count: usize,
        floor_points: &BTreeSet<Label>,
    ) -> Result<ParamMap, CalibrationError> {
        let mut initial = BTreeMap::new();
        for (view, params) in current {
            if *view >= view_count {
                continue;
            }
            initial.insert(*view, from_params(params)?);
        }
        if initial.is_empty() {
            return Err(CalibrationError::InsufficientCorrespondence(
                "no calibrated cameras to refine".to_string(),
            ));
        }

        let solved = refine_homographies(&initial, data, view_count, floor_points)?;
        info!("Jointly refined {} cameras", solved.len());
        Ok(solved.iter().map(|(view, h)| (*view, to_params(h))).collect())
    }

    fn estimate_anchors(
        &self,
        target: View,
        calibrated: &BTreeSet<View>,
        current: &ParamMap,
        data: &PointData,
        floor_points: &BTreeSet<Label>,
    ) -> Result<AnchorMap, CalibrationError> {
        let target_points = view_points(data, target)?;

        let mut sources = BTreeMap::new();
        for view in calibrated.iter().filter(|view| **view != target) {
            if let (Some(params), Some(points)) = (current.get(view), data.get(view)) {
                sources.insert(*view, (from_params(params)?, points));
            }
        }

        let mut anchors = AnchorMap::new();
        for label in target_points.keys() {
            if !is_planar(*label, floor_points) {
                continue;
            }
            let projections: Vec<Vector2<f64>> = sources
                .values()
                .filter_map(|(h, points)| points.get(label).and_then(|p| apply(h, p)))
                .collect();
            if projections.is_empty() {
                continue;
            }
            let mean = projections.iter().fold(Vector2::<f64>::zeros(), |acc, p| acc + p)
                / projections.len() as f64;
            anchors.insert(*label, mean);
        }

        if anchors.is_empty() {
            return Err(CalibrationError::InsufficientCorrespondence(format!(
                "view {target} shares no planar points with calibrated views"
            )));
        }

        debug!("Estimated {} anchors for view {target}", anchors.len());
        Ok(anchors)
    }

    fn calibrate_one(
        &self,
        target: View,
        anchors: &AnchorMap,
        data: &PointData,
        view_count: usize,
    ) -> Result<CalibrationParams, CalibrationError> {
        let points = view_points(data, target)?;
        let labels: BTreeSet<Label> = points
            .keys()
            .filter(|label| anchors.contains_key(label))
            .copied()
            .collect();
        self.check_count(labels.len(), "anchored correspondences")?;

        // A map observation of an anchored label is an exact ground coordinate.
        let mut ground = anchors.clone();
        if let Some(map) = data.get(&view_count) {
            for label in &labels {
                if let Some(observed) = map.get(label) {
                    ground.insert(*label, *observed);
                }
            }
        }

        let mut h = self.fit(points, &ground, &labels)?;
        if self.refine {
            // Anchors play the role of the map for a single-camera refinement.
            let mut anchor_data = PointData::new();
            anchor_data.insert(
                target,
                labels.iter().map(|label| (*label, points[label])).collect(),
            );
            anchor_data.insert(
                view_count,
                labels.iter().map(|label| (*label, ground[label])).collect(),
            );
            let initial: BTreeMap<View, Matrix3<f64>> = [(target, h)].into_iter().collect();
            let refined = refine_homographies(&initial, &anchor_data, view_count, &BTreeSet::new())?;
            if let Some(refined_h) = refined.get(&target) {
                h = *refined_h;
            }
        }

        info!("Calibrated view {target} from {} anchors", labels.len());
        Ok(to_params(&h))
    }
}

impl GroundProjection for PlanarHomographySolver {
    fn project_to_ground(
        &self,
        params: &CalibrationParams,
        point: &Vector2<f64>,
    ) -> Result<Vector2<f64>, CalibrationError> {
        let h = from_params(params)?;
        apply(&h, point).ok_or_else(|| {
            CalibrationError::UnderdeterminedSystem("point maps to the horizon".to_string())
        })
    }
}
