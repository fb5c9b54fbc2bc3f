//! The `optimization` module defines the solver seam of the calibration workflow.
//!
//! The [`Solver`] trait lists the numeric routines the
//! [`CalibrationOrchestrator`](crate::calibration::CalibrationOrchestrator)
//! delegates to. Every routine consumes normalized correspondences (see
//! [`Normalizer`](crate::geometry::Normalizer)) and returns opaque
//! [`CalibrationParams`]; the orchestrator never interprets them.
//!
//! [`PlanarHomographySolver`] is the bundled implementation. It models each
//! camera as a homography onto the ground plane of the reference map and
//! refines the estimates with the `tiny_solver` Levenberg-Marquardt optimizer.

use nalgebra::Vector2;
use std::collections::BTreeSet;

use crate::calibration::{AnchorMap, CalibrationError, CalibrationParams, ParamMap};
use crate::correspondence::{Label, PointData};
use crate::view::View;

pub mod planar;
pub mod refine;

pub use planar::PlanarHomographySolver;

/// Numeric routines behind the three calibration stages.
///
/// `view_count` is the number of cameras; the reference map is the view with
/// index `view_count`. Implementations must be pure functions of their inputs
/// so that they can run on a snapshot away from the editing thread.
pub trait Solver {
    /// Calibrates two cameras from the correspondences they share.
    ///
    /// # Returns
    ///
    /// Parameters for every view the solver could determine, usually both.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InsufficientCorrespondence`] - too few or
    ///   degenerate shared points.
    /// * [`CalibrationError::UnderdeterminedSystem`] - numeric failure.
    fn calibrate_pair(
        &self,
        data: &PointData,
        view_a: View,
        view_b: View,
        floor_points: &BTreeSet<Label>,
        view_count: usize,
    ) -> Result<ParamMap, CalibrationError>;

    /// Jointly refines every view in `current`, using it as the initial guess
    /// and all available correspondences.
    fn calibrate_joint(
        &self,
        current: &ParamMap,
        data: &PointData,
        view_count: usize,
        floor_points: &BTreeSet<Label>,
    ) -> Result<ParamMap, CalibrationError>;

    /// Computes ground coordinates for the labels of `target` from the
    /// calibrated views that share them.
    fn estimate_anchors(
        &self,
        target: View,
        calibrated: &BTreeSet<View>,
        current: &ParamMap,
        data: &PointData,
        floor_points: &BTreeSet<Label>,
    ) -> Result<AnchorMap, CalibrationError>;

    /// Calibrates `target` alone from its own points and the anchors.
    fn calibrate_one(
        &self,
        target: View,
        anchors: &AnchorMap,
        data: &PointData,
        view_count: usize,
    ) -> Result<CalibrationParams, CalibrationError>;
}

/// Maps normalized camera coordinates onto the normalized reference map.
pub trait GroundProjection {
    fn project_to_ground(
        &self,
        params: &CalibrationParams,
        point: &Vector2<f64>,
    ) -> Result<Vector2<f64>, CalibrationError>;
}

/// Whether `label` may be used as a ground-plane constraint.
///
/// With no floor points marked every label counts as planar.
pub fn is_planar(label: Label, floor_points: &BTreeSet<Label>) -> bool {
    floor_points.is_empty() || floor_points.contains(&label)
}
