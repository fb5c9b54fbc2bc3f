//! Calibration state and the staged calibration workflow.
//!
//! Calibration proceeds in three kinds of stages, all driven by
//! [`CalibrationOrchestrator`]:
//! 1. pairwise bootstrap of two cameras from the points they share,
//! 2. joint refinement of every calibrated camera,
//! 3. incremental addition of one camera anchored on the calibrated ones.
//!
//! A stage either commits all of its results or leaves the calibrated state
//! untouched.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::correspondence::Label;
use crate::view::View;

pub mod job;
pub mod orchestrator;

pub use job::{SolveJob, SolveOutcome, SolveRequest};
pub use orchestrator::CalibrationOrchestrator;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Insufficient correspondences: {0}")]
    InsufficientCorrespondence(String),
    #[error("Underdetermined system: {0}")]
    UnderdeterminedSystem(String),
    #[error("View {0} is not part of the session")]
    UnknownView(View),
    #[error("View {0} is not calibrated")]
    NotCalibrated(View),
    #[error("View {0} has points but no known shape")]
    MissingShape(View),
    #[error("Result discarded: views {0:?} were cleared while solving")]
    StaleResult(Vec<View>),
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
}

/// Opaque per-view parameter blob produced by a solver.
///
/// The orchestrator never looks inside; only the solver that produced the
/// values knows their layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationParams {
    values: Vec<f64>,
}

impl CalibrationParams {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

impl From<Vec<f64>> for CalibrationParams {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

/// Parameters of calibrated views.
pub type ParamMap = BTreeMap<View, CalibrationParams>;

/// Ground coordinates of labels, derived from already calibrated views.
pub type AnchorMap = BTreeMap<Label, Vector2<f64>>;
