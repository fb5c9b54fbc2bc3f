//! Operator-supplied point correspondences.
//!
//! A [`Label`] names one physical point. Observing the same label in two or
//! more views asserts that those pixels see the same point. Coordinates are
//! always kept in the native resolution of their view.

use nalgebra::Vector2;
use std::collections::BTreeMap;

use crate::view::View;

pub mod store;

pub use store::CorrespondenceStore;

/// Identity of a physical point, shared across views.
pub type Label = u32;

/// Points of a single view, keyed by label.
pub type ViewPoints = BTreeMap<Label, Vector2<f64>>;

/// Points of every view, keyed by view and then by label.
pub type PointData = BTreeMap<View, ViewPoints>;
