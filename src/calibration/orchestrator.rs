//! Drives the staged calibration workflow over a [`CorrespondenceStore`].

use log::{debug, info, warn};
use nalgebra::Vector2;
use std::collections::{BTreeMap, BTreeSet};

use super::job::{SolveJob, SolveOutcome, SolveRequest};
use super::{CalibrationError, CalibrationParams, ParamMap};
use crate::correspondence::{CorrespondenceStore, PointData};
use crate::geometry::{sample_points, Normalizer, ProjectionError, ShapeNormalizer};
use crate::optimization::{GroundProjection, PlanarHomographySolver, Solver};
use crate::view::{View, ViewLayout, ViewShapes};

/// Owner of the calibrated views and their parameters.
///
/// The calibrated set is exactly the key set of the parameter map, so the two
/// can never disagree. A view becomes calibrated only through a committed
/// stage (or when restoring saved parameters) and stops being calibrated only
/// through [`clear`](Self::clear).
#[derive(Debug, Clone)]
pub struct CalibrationOrchestrator<S = PlanarHomographySolver, N = ShapeNormalizer> {
    solver: S,
    normalizer: N,
    layout: ViewLayout,
    shapes: ViewShapes,
    min_correspondences: usize,
    params: ParamMap,
    /// Bumped by `clear`; outcomes prepared under an older generation are stale.
    generations: BTreeMap<View, u64>,
}

impl CalibrationOrchestrator {
    /// Orchestrator with the planar solver and shape normalizer.
    pub fn planar(layout: ViewLayout, min_correspondences: usize) -> Self {
        Self::new(
            layout,
            PlanarHomographySolver::new(min_correspondences),
            ShapeNormalizer,
        )
        .with_min_correspondences(min_correspondences)
    }
}

impl<S: Solver, N: Normalizer> CalibrationOrchestrator<S, N> {
    pub fn new(layout: ViewLayout, solver: S, normalizer: N) -> Self {
        let shapes = layout.shapes();
        Self {
            solver,
            normalizer,
            layout,
            shapes,
            min_correspondences: 4,
            params: ParamMap::new(),
            generations: BTreeMap::new(),
        }
    }

    /// Minimum number of labels two cameras must share before a pair solve.
    pub fn with_min_correspondences(mut self, min_correspondences: usize) -> Self {
        self.min_correspondences = min_correspondences.max(1);
        self
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn layout(&self) -> &ViewLayout {
        &self.layout
    }

    pub fn view_count(&self) -> usize {
        self.layout.view_count()
    }

    pub fn is_calibrated(&self, view: View) -> bool {
        self.params.contains_key(&view)
    }

    pub fn calibrated(&self) -> BTreeSet<View> {
        self.params.keys().copied().collect()
    }

    pub fn params(&self) -> &ParamMap {
        &self.params
    }

    pub fn params_of(&self, view: View) -> Option<&CalibrationParams> {
        self.params.get(&view)
    }

    fn generation(&self, view: View) -> u64 {
        self.generations.get(&view).copied().unwrap_or(0)
    }

    fn generations_of<'a>(&self, views: impl IntoIterator<Item = &'a View>) -> BTreeMap<View, u64> {
        views
            .into_iter()
            .map(|view| (*view, self.generation(*view)))
            .collect()
    }

    fn require_camera(&self, view: View) -> Result<(), CalibrationError> {
        if self.layout.is_camera(view) {
            Ok(())
        } else {
            Err(CalibrationError::UnknownView(view))
        }
    }

    /// Normalizes the live store. Never cached: any edit invalidates it.
    pub fn normalize_all(&self, store: &CorrespondenceStore) -> Result<PointData, CalibrationError> {
        self.normalizer.normalize(store.point_data(), &self.shapes)
    }

    /// Captures a pairwise bootstrap of `view_a` and `view_b`.
    ///
    /// The snapshot only holds labels observed in both cameras, for the two
    /// cameras and the reference map.
    pub fn prepare_pair(
        &self,
        store: &CorrespondenceStore,
        view_a: View,
        view_b: View,
    ) -> Result<SolveJob, CalibrationError> {
        self.require_camera(view_a)?;
        self.require_camera(view_b)?;
        if view_a == view_b {
            return Err(CalibrationError::InvalidParams(format!(
                "pair calibration needs two different cameras, got {view_a} twice"
            )));
        }

        let shared = store.shared_labels(view_a, view_b);
        if shared.len() < self.min_correspondences {
            return Err(CalibrationError::InsufficientCorrespondence(format!(
                "cameras {view_a} and {view_b} share {} points, need at least {}",
                shared.len(),
                self.min_correspondences
            )));
        }

        let map_view = self.layout.map_index();
        let restricted: PointData = store
            .point_data()
            .iter()
            .filter(|(view, _)| [view_a, view_b, map_view].contains(view))
            .map(|(view, points)| {
                let points = points
                    .iter()
                    .filter(|(label, _)| shared.contains(label))
                    .map(|(label, point)| (*label, *point))
                    .collect();
                (*view, points)
            })
            .collect();
        let data = self.normalizer.normalize(&restricted, &self.shapes)?;

        debug!(
            "Prepared pair {view_a}/{view_b} with {} shared labels",
            shared.len()
        );
        Ok(SolveJob {
            request: SolveRequest::Pair { view_a, view_b },
            data,
            floor_points: store.floor_points().clone(),
            params: ParamMap::new(),
            view_count: self.view_count(),
            generations: self.generations_of(&[view_a, view_b]),
        })
    }

    /// Captures a joint refinement of every calibrated camera.
    pub fn prepare_joint(&self, store: &CorrespondenceStore) -> Result<SolveJob, CalibrationError> {
        if self.params.is_empty() {
            return Err(CalibrationError::InsufficientCorrespondence(
                "joint refinement needs at least one calibrated camera".to_string(),
            ));
        }
        Ok(SolveJob {
            request: SolveRequest::Joint,
            data: self.normalize_all(store)?,
            floor_points: store.floor_points().clone(),
            params: self.params.clone(),
            view_count: self.view_count(),
            generations: self.generations_of(self.params.keys()),
        })
    }

    /// Captures the incremental addition of `target`.
    ///
    /// Fails before any solve when `target` shares no label with a calibrated
    /// camera other than itself.
    pub fn prepare_one(
        &self,
        store: &CorrespondenceStore,
        target: View,
    ) -> Result<SolveJob, CalibrationError> {
        self.require_camera(target)?;

        let sources: ParamMap = self
            .params
            .iter()
            .filter(|(view, _)| **view != target)
            .map(|(view, params)| (*view, params.clone()))
            .collect();
        let shares_label = store.points_in(target).keys().any(|label| {
            store
                .views_with(*label)
                .iter()
                .any(|view| sources.contains_key(view))
        });
        if !shares_label {
            return Err(CalibrationError::InsufficientCorrespondence(format!(
                "view {target} shares no points with calibrated views {:?}",
                sources.keys().collect::<Vec<_>>()
            )));
        }

        let mut views: BTreeSet<View> = sources.keys().copied().collect();
        views.insert(target);
        Ok(SolveJob {
            request: SolveRequest::One { target },
            data: self.normalize_all(store)?,
            floor_points: store.floor_points().clone(),
            params: sources,
            view_count: self.view_count(),
            generations: self.generations_of(&views),
        })
    }

    /// Merges a finished job.
    ///
    /// The merge is all or nothing: when any view the job depended on was
    /// cleared after the job was prepared, nothing is applied and
    /// [`CalibrationError::StaleResult`] is returned.
    pub fn commit(&mut self, outcome: SolveOutcome) -> Result<Vec<View>, CalibrationError> {
        let stale: Vec<View> = outcome
            .generations
            .iter()
            .filter(|(view, generation)| self.generation(**view) != **generation)
            .map(|(view, _)| *view)
            .collect();
        if !stale.is_empty() {
            warn!("Discarding {:?} result: views {stale:?} changed", outcome.request);
            return Err(CalibrationError::StaleResult(stale));
        }

        let updated: Vec<View> = outcome.params.keys().copied().collect();
        self.params.extend(outcome.params);
        info!("{:?} committed views {updated:?}", outcome.request);
        Ok(updated)
    }

    fn solve_and_commit(&mut self, job: SolveJob) -> Result<Vec<View>, CalibrationError> {
        let outcome = job.run(&self.solver)?;
        self.commit(outcome)
    }

    /// Pairwise bootstrap of two cameras from the points they share.
    ///
    /// # Arguments
    ///
    /// * `store` - Current correspondences; only labels seen by both cameras are used
    /// * `view_a` - First camera
    /// * `view_b` - Second camera
    ///
    /// # Returns
    ///
    /// * `Result<Vec<View>, CalibrationError>` - Views that were calibrated;
    ///   on error nothing changes
    pub fn calibrate_pair(
        &mut self,
        store: &CorrespondenceStore,
        view_a: View,
        view_b: View,
    ) -> Result<Vec<View>, CalibrationError> {
        let job = self.prepare_pair(store, view_a, view_b)?;
        self.solve_and_commit(job)
    }

    /// Joint refinement of all calibrated cameras against every correspondence.
    ///
    /// # Arguments
    ///
    /// * `store` - Current correspondences
    ///
    /// # Returns
    ///
    /// * `Result<Vec<View>, CalibrationError>` - Views that were refined; on
    ///   error the previous parameters are kept
    pub fn calibrate_joint(
        &mut self,
        store: &CorrespondenceStore,
    ) -> Result<Vec<View>, CalibrationError> {
        let job = self.prepare_joint(store)?;
        self.solve_and_commit(job)
    }

    /// Adds `target` to the calibrated set using anchors from calibrated cameras.
    ///
    /// # Arguments
    ///
    /// * `store` - Current correspondences
    /// * `target` - Camera to calibrate
    ///
    /// # Returns
    ///
    /// * `Result<Vec<View>, CalibrationError>` - `[target]` on success;
    ///   `InsufficientCorrespondence` before any solve when `target` shares
    ///   no point with a calibrated camera
    pub fn calibrate_one(
        &mut self,
        store: &CorrespondenceStore,
        target: View,
    ) -> Result<Vec<View>, CalibrationError> {
        let job = self.prepare_one(store, target)?;
        self.solve_and_commit(job)
    }

    /// Forgets the calibration of `view`. Returns false if it had none.
    pub fn clear(&mut self, view: View) -> bool {
        if self.params.remove(&view).is_none() {
            return false;
        }
        *self.generations.entry(view).or_insert(0) += 1;
        info!("Cleared calibration of view {view}");
        true
    }

    /// Restores previously saved parameters for a camera.
    pub fn restore(&mut self, view: View, params: CalibrationParams) -> Result<(), CalibrationError> {
        self.require_camera(view)?;
        if params.is_empty() || !params.is_finite() {
            return Err(CalibrationError::InvalidParams(format!(
                "saved parameters of view {view} are empty or not finite"
            )));
        }
        self.params.insert(view, params);
        Ok(())
    }
}

impl<S: Solver + GroundProjection, N: Normalizer> CalibrationOrchestrator<S, N> {
    fn calibrated_params(&self, view: View) -> Result<&CalibrationParams, CalibrationError> {
        self.require_camera(view)?;
        self.params
            .get(&view)
            .ok_or(CalibrationError::NotCalibrated(view))
    }

    /// Projects a grid of camera pixels onto the reference map.
    ///
    /// Returns `(camera pixel, map pixel)` pairs in native resolution; grid
    /// points that map to the horizon are skipped.
    pub fn ground_preview(
        &self,
        view: View,
        num_points: usize,
        offset: f64,
    ) -> Result<Vec<(Vector2<f64>, Vector2<f64>)>, CalibrationError> {
        let params = self.calibrated_params(view)?;
        let shape = self
            .shapes
            .get(&view)
            .ok_or(CalibrationError::MissingShape(view))?;
        let map_view = self.layout.map_index();

        let mut pairs = Vec::new();
        for pixel in sample_points(shape.width as f64, shape.height as f64, num_points, offset) {
            let normalized = self.normalizer.normalize_point(view, &pixel, &self.shapes)?;
            let Ok(ground) = self.solver.project_to_ground(params, &normalized) else {
                continue;
            };
            let map_pixel = self.normalizer.denormalize(map_view, &ground, &self.shapes)?;
            pairs.push((pixel, map_pixel));
        }
        Ok(pairs)
    }

    /// Map-pixel distances between projected camera points and their
    /// observed map positions.
    pub fn reprojection_error(
        &self,
        store: &CorrespondenceStore,
        view: View,
    ) -> Result<ProjectionError, CalibrationError> {
        let params = self.calibrated_params(view)?;
        let map_view = self.layout.map_index();

        let mut errors = Vec::new();
        for (label, pixel) in store.points_in(view) {
            let Some(observed) = store.point(map_view, label) else {
                continue;
            };
            let normalized = self.normalizer.normalize_point(view, &pixel, &self.shapes)?;
            let ground = self.solver.project_to_ground(params, &normalized)?;
            let projected = self.normalizer.denormalize(map_view, &ground, &self.shapes)?;
            errors.push((projected - observed).norm());
        }

        ProjectionError::from_errors(&errors).ok_or_else(|| {
            CalibrationError::InsufficientCorrespondence(format!(
                "view {view} shares no points with the map"
            ))
        })
    }
}
