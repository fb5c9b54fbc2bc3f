//! The authoritative owner of per-view point coordinates and floor points.

use log::{debug, warn};
use nalgebra::Vector2;
use std::collections::BTreeSet;

use super::{Label, PointData, ViewPoints};
use crate::view::View;

/// Per-view labeled points plus the set of labels lying on the ground plane.
///
/// Invariants kept by every operation:
/// * the floor set is a subset of the labels present in some view,
/// * views without points are not stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrespondenceStore {
    points: PointData,
    floor_points: BTreeSet<Label>,
}

impl CorrespondenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from persisted parts.
    ///
    /// Empty views are dropped and floor labels that appear in no view are
    /// discarded with a warning.
    pub fn from_parts(points: PointData, floor_points: BTreeSet<Label>) -> Self {
        let points: PointData = points
            .into_iter()
            .filter(|(_, view_points)| !view_points.is_empty())
            .collect();
        let mut store = Self {
            points,
            floor_points: BTreeSet::new(),
        };
        let present = store.labels();
        for label in floor_points {
            if present.contains(&label) {
                store.floor_points.insert(label);
            } else {
                warn!("Dropping floor point {label}: not observed in any view");
            }
        }
        store
    }

    /// Adds a point under a freshly allocated label and returns the label.
    ///
    /// The label is the first gap in the sorted label sequence, or one past
    /// the maximum when the sequence is dense (0 for an empty store).
    ///
    /// # Arguments
    ///
    /// * `view` - View the point is observed in
    /// * `coord` - Native pixel coordinate of the point
    ///
    /// # Returns
    ///
    /// * `Label` - The label allocated for the new point
    pub fn add_point(&mut self, view: View, coord: Vector2<f64>) -> Label {
        let label = self.next_label();
        self.points.entry(view).or_default().insert(label, coord);
        debug!("Added point {label} in view {view} at ({}, {})", coord.x, coord.y);
        label
    }

    /// Creates or overwrites the coordinate of an existing label in `view`.
    pub fn set_point(&mut self, view: View, label: Label, coord: Vector2<f64>) {
        self.points.entry(view).or_default().insert(label, coord);
        debug!("Set point {label} in view {view} to ({}, {})", coord.x, coord.y);
    }

    /// Removes `label` from `view`.
    ///
    /// Returns false and changes nothing when the entry does not exist. When
    /// the label is left in no view it is removed everywhere, including the
    /// floor set.
    pub fn delete_in_view(&mut self, view: View, label: Label) -> bool {
        let Some(view_points) = self.points.get_mut(&view) else {
            return false;
        };
        if view_points.remove(&label).is_none() {
            return false;
        }
        if view_points.is_empty() {
            self.points.remove(&view);
        }
        debug!("Deleted point {label} in view {view}");

        if !self.contains_label(label) {
            self.delete_everywhere(label);
        }
        true
    }

    /// Removes `label` from every view and from the floor set.
    ///
    /// Returns true if anything was removed.
    pub fn delete_everywhere(&mut self, label: Label) -> bool {
        let mut removed = false;
        for view_points in self.points.values_mut() {
            removed |= view_points.remove(&label).is_some();
        }
        self.points.retain(|_, view_points| !view_points.is_empty());
        removed |= self.floor_points.remove(&label);
        if removed {
            debug!("Deleted point {label} from all views");
        }
        removed
    }

    /// Flips floor membership of `label`.
    ///
    /// Returns the new membership, or `None` when the label is present in no
    /// view (the floor set only holds observed labels).
    pub fn toggle_floor(&mut self, label: Label) -> Option<bool> {
        if !self.contains_label(label) {
            warn!("Cannot toggle floor point {label}: not observed in any view");
            return None;
        }
        if self.floor_points.remove(&label) {
            Some(false)
        } else {
            self.floor_points.insert(label);
            Some(true)
        }
    }

    /// All labels present in at least one view, ascending.
    pub fn labels(&self) -> BTreeSet<Label> {
        self.points
            .values()
            .flat_map(|view_points| view_points.keys().copied())
            .collect()
    }

    /// Points of `view`; empty when the view has none.
    pub fn points_in(&self, view: View) -> ViewPoints {
        self.points.get(&view).cloned().unwrap_or_default()
    }

    pub fn point(&self, view: View, label: Label) -> Option<Vector2<f64>> {
        self.points
            .get(&view)
            .and_then(|view_points| view_points.get(&label))
            .copied()
    }

    pub fn contains_label(&self, label: Label) -> bool {
        self.points
            .values()
            .any(|view_points| view_points.contains_key(&label))
    }

    /// Views in which `label` is observed.
    pub fn views_with(&self, label: Label) -> BTreeSet<View> {
        self.points
            .iter()
            .filter(|(_, view_points)| view_points.contains_key(&label))
            .map(|(view, _)| *view)
            .collect()
    }

    /// Keeps only the views accepted by `keep` and returns the dropped ones.
    ///
    /// Floor labels left without any observation are dropped as well.
    pub fn retain_views<F: Fn(View) -> bool>(&mut self, keep: F) -> Vec<View> {
        let dropped: Vec<View> = self
            .points
            .keys()
            .copied()
            .filter(|view| !keep(*view))
            .collect();
        if dropped.is_empty() {
            return dropped;
        }
        for view in &dropped {
            self.points.remove(view);
        }
        let present = self.labels();
        self.floor_points.retain(|label| present.contains(label));
        dropped
    }

    /// Labels observed in both `a` and `b`.
    pub fn shared_labels(&self, a: View, b: View) -> BTreeSet<Label> {
        match (self.points.get(&a), self.points.get(&b)) {
            (Some(pa), Some(pb)) => pa.keys().filter(|l| pb.contains_key(l)).copied().collect(),
            _ => BTreeSet::new(),
        }
    }

    pub fn is_floor(&self, label: Label) -> bool {
        self.floor_points.contains(&label)
    }

    pub fn floor_points(&self) -> &BTreeSet<Label> {
        &self.floor_points
    }

    /// Read-only view of every stored coordinate.
    pub fn point_data(&self) -> &PointData {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn next_label(&self) -> Label {
        let labels = self.labels();
        let mut next = 0;
        for (rank, label) in labels.iter().enumerate() {
            if *label as usize != rank {
                return rank as Label;
            }
            next = label + 1;
        }
        next
    }
}
