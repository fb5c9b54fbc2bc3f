//! Ground Calibration Library
//!
//! Multi-view ground-plane calibration from point correspondences that an
//! operator marks across several camera images and one top-down reference map.
//! The library provides:
//! - a correspondence store with label allocation, cascading deletes and
//!   floor (ground-plane) marking,
//! - a staged calibration workflow: pairwise bootstrap, joint refinement and
//!   incremental addition of single cameras,
//! - a planar homography solver refined with the tiny-solver
//!   Levenberg-Marquardt optimizer,
//! - persistence of point records, per-view parameters and session configs.

pub mod calibration;
pub mod correspondence;
pub mod geometry;
pub mod io;
pub mod optimization;
pub mod view;

// Re-export commonly used types
pub use calibration::{
    CalibrationError, CalibrationOrchestrator, CalibrationParams, ParamMap, SolveJob,
    SolveOutcome, SolveRequest,
};
pub use correspondence::{CorrespondenceStore, Label, PointData};
pub use geometry::{Normalizer, ProjectionError, ShapeNormalizer};
pub use io::{PersistenceError, Session, SessionConfig};
pub use optimization::{GroundProjection, PlanarHomographySolver, Solver};
pub use view::{View, ViewInfo, ViewLayout, ViewShape};
