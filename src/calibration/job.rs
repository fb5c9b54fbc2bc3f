//! Snapshot solve jobs.
//!
//! A [`SolveJob`] owns everything a solver call needs, captured at the moment
//! the job was prepared. Edits made to the correspondence store while the job
//! runs are not visible to it. The job can be moved to another thread; its
//! [`SolveOutcome`] is merged back with
//! [`CalibrationOrchestrator::commit`](super::CalibrationOrchestrator::commit).

use log::debug;
use std::collections::{BTreeMap, BTreeSet};

use super::{CalibrationError, ParamMap};
use crate::correspondence::{Label, PointData};
use crate::optimization::Solver;
use crate::view::View;

/// The calibration stage a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveRequest {
    Pair { view_a: View, view_b: View },
    Joint,
    One { target: View },
}

/// Immutable input of one solver invocation.
#[derive(Debug, Clone)]
pub struct SolveJob {
    pub(crate) request: SolveRequest,
    pub(crate) data: PointData,
    pub(crate) floor_points: BTreeSet<Label>,
    pub(crate) params: ParamMap,
    pub(crate) view_count: usize,
    pub(crate) generations: BTreeMap<View, u64>,
}

/// Result of a successful job, not yet merged into calibrated state.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveOutcome {
    pub(crate) request: SolveRequest,
    pub(crate) params: ParamMap,
    pub(crate) generations: BTreeMap<View, u64>,
}

impl SolveJob {
    pub fn request(&self) -> SolveRequest {
        self.request
    }

    /// Normalized correspondences captured for this job.
    pub fn data(&self) -> &PointData {
        &self.data
    }

    pub fn floor_points(&self) -> &BTreeSet<Label> {
        &self.floor_points
    }

    /// Runs the solver on the snapshot.
    ///
    /// Only parameters for views the request may touch are kept: the two
    /// cameras of a pair, the already calibrated cameras of a joint
    /// refinement, the target of a single-view addition.
    pub fn run<S: Solver + ?Sized>(&self, solver: &S) -> Result<SolveOutcome, CalibrationError> {
        let params = match self.request {
            SolveRequest::Pair { view_a, view_b } => {
                let solved = solver.calibrate_pair(
                    &self.data,
                    view_a,
                    view_b,
                    &self.floor_points,
                    self.view_count,
                )?;
                let kept: ParamMap = solved
                    .into_iter()
                    .filter(|(view, _)| *view == view_a || *view == view_b)
                    .collect();
                if kept.is_empty() {
                    return Err(CalibrationError::InsufficientCorrespondence(format!(
                        "no camera of pair {view_a}/{view_b} could be determined"
                    )));
                }
                kept
            }
            SolveRequest::Joint => {
                let solved = solver.calibrate_joint(
                    &self.params,
                    &self.data,
                    self.view_count,
                    &self.floor_points,
                )?;
                let kept: ParamMap = solved
                    .into_iter()
                    .filter(|(view, _)| self.params.contains_key(view))
                    .collect();
                if kept.is_empty() {
                    return Err(CalibrationError::UnderdeterminedSystem(
                        "joint refinement returned no calibrated view".to_string(),
                    ));
                }
                kept
            }
            SolveRequest::One { target } => {
                let calibrated: BTreeSet<View> = self.params.keys().copied().collect();
                let anchors = solver.estimate_anchors(
                    target,
                    &calibrated,
                    &self.params,
                    &self.data,
                    &self.floor_points,
                )?;
                let params = solver.calibrate_one(target, &anchors, &self.data, self.view_count)?;
                ParamMap::from([(target, params)])
            }
        };

        if let Some((view, _)) = params.iter().find(|(_, p)| p.is_empty() || !p.is_finite()) {
            return Err(CalibrationError::UnderdeterminedSystem(format!(
                "solver returned invalid parameters for view {view}"
            )));
        }

        debug!("{:?} produced parameters for {} views", self.request, params.len());
        Ok(SolveOutcome {
            request: self.request,
            params,
            generations: self.generations.clone(),
        })
    }
}

impl SolveOutcome {
    pub fn request(&self) -> SolveRequest {
        self.request
    }

    pub fn params(&self) -> &ParamMap {
        &self.params
    }
}
