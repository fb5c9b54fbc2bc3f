//! A calibration session bound to a directory on disk.

use log::{info, warn};
use nalgebra::Vector2;
use std::fs;
use std::path::{Path, PathBuf};

use super::config::{SessionConfig, ViewSpec, CONFIG_FILE};
use super::export::export_csv;
use super::params::{load_params, save_params};
use super::record::{load_record, save_record};
use super::{session_folder_name, PersistenceError};
use crate::calibration::{CalibrationError, CalibrationOrchestrator, SolveRequest};
use crate::correspondence::CorrespondenceStore;
use crate::geometry::ProjectionError;
use crate::view::{View, ViewLayout};

pub const PARAMS_DIR: &str = "params";

/// Evaluation of one calibrated camera.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// `(camera pixel, map pixel)` pairs of the preview grid.
    pub preview: Vec<(Vector2<f64>, Vector2<f64>)>,
    /// Map-pixel error on points also marked on the map, when there are any.
    pub error: Option<ProjectionError>,
}

pub struct Session {
    dir: PathBuf,
    config: SessionConfig,
    store: CorrespondenceStore,
    orchestrator: CalibrationOrchestrator,
    skipped: Vec<PersistenceError>,
}

impl Session {
    /// Opens the session described by `<dir>/session.yaml`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref();
        let config = SessionConfig::load_from_yaml(dir.join(CONFIG_FILE))?;
        Self::with_config(dir, config)
    }

    /// Opens a session in `dir` with an explicit configuration, loading the
    /// point record and parameter files when they exist.
    pub fn with_config<P: AsRef<Path>>(dir: P, config: SessionConfig) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        let layout = config.layout(&dir)?;

        let record_path = dir.join(&config.record_file);
        let mut store = if record_path.exists() {
            load_record(&record_path)?
        } else {
            info!("No point record at {}, starting empty", record_path.display());
            CorrespondenceStore::new()
        };
        for view in store.retain_views(|view| layout.contains(view)) {
            warn!(
                "Dropping points of view {view} from {}: not part of the session",
                record_path.display()
            );
        }

        let mut orchestrator =
            CalibrationOrchestrator::planar(layout, config.solver.min_correspondences);
        let report = load_params(dir.join(PARAMS_DIR), orchestrator.layout())?;
        for (view, params) in report.loaded {
            orchestrator
                .restore(view, params)
                .map_err(|e| PersistenceError::LoadError(e.to_string()))?;
        }
        for skipped in &report.skipped {
            warn!("{skipped}");
        }

        Ok(Self {
            dir,
            config,
            store,
            orchestrator,
            skipped: report.skipped,
        })
    }

    /// Creates a new session under `parent`, in the folder named after the
    /// session's images (see [`session_folder_name`]).
    ///
    /// Image paths of `config` are resolved relative to `parent`; the stored
    /// config keeps the resolved names and shapes so the session directory is
    /// self-contained.
    pub fn create_in<P: AsRef<Path>>(parent: P, config: SessionConfig) -> Result<Self, PersistenceError> {
        let parent = parent.as_ref();
        let layout = config.layout(parent)?;
        let dir = parent.join(session_folder_name(&layout));

        let resolved = SessionConfig {
            views: layout
                .cameras()
                .iter()
                .map(|info| ViewSpec::named(info.name.clone(), info.shape))
                .collect(),
            map: layout
                .map()
                .map(|info| ViewSpec::named(info.name.clone(), info.shape)),
            ..config
        };
        let session = Self::with_config(&dir, resolved)?;
        session.save()?;
        info!("Created session {}", dir.display());
        Ok(session)
    }

    /// Writes config, point record and parameter files.
    pub fn save(&self) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir)?;
        self.config.save_to_yaml(self.dir.join(CONFIG_FILE))?;
        save_record(self.dir.join(&self.config.record_file), &self.store)?;
        save_params(
            self.dir.join(PARAMS_DIR),
            self.orchestrator.layout(),
            self.orchestrator.params(),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn layout(&self) -> &ViewLayout {
        self.orchestrator.layout()
    }

    pub fn store(&self) -> &CorrespondenceStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut CorrespondenceStore {
        &mut self.store
    }

    pub fn orchestrator(&self) -> &CalibrationOrchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut CalibrationOrchestrator {
        &mut self.orchestrator
    }

    /// Parameter files that matched no view when the session was opened.
    pub fn skipped_parameter_files(&self) -> &[PersistenceError] {
        &self.skipped
    }

    /// Runs one calibration stage against the current points.
    pub fn calibrate(&mut self, request: SolveRequest) -> Result<Vec<View>, CalibrationError> {
        match request {
            SolveRequest::Pair { view_a, view_b } => {
                self.orchestrator.calibrate_pair(&self.store, view_a, view_b)
            }
            SolveRequest::Joint => self.orchestrator.calibrate_joint(&self.store),
            SolveRequest::One { target } => self.orchestrator.calibrate_one(&self.store, target),
        }
    }

    pub fn evaluate(&self, view: View) -> Result<Evaluation, CalibrationError> {
        let settings = &self.config.solver;
        let preview = self.orchestrator.ground_preview(
            view,
            settings.preview_points,
            settings.preview_offset,
        )?;
        let error = match self.orchestrator.reprojection_error(&self.store, view) {
            Ok(error) => Some(error),
            Err(CalibrationError::InsufficientCorrespondence(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(Evaluation { preview, error })
    }

    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> Result<usize, PersistenceError> {
        export_csv(path, &self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use crate::calibration::CalibrationParams;
    use crate::correspondence::Label;
    use crate::geometry::homography::apply;
    use crate::geometry::ShapeNormalizer;
    use crate::optimization::planar::tests::{ground, truth};
    use crate::view::ViewShape;

    fn config() -> SessionConfig {
        SessionConfig::new(
            vec![
                ViewSpec::named("left.png", ViewShape::new(480, 640, 3)),
                ViewSpec::named("right.png", ViewShape::new(480, 640, 3)),
            ],
            Some(ViewSpec::named("minimap.png", ViewShape::new(600, 800, 3))),
        )
    }

    fn fill(session: &mut Session) {
        let shapes = session.layout().shapes();
        let map_view = session.layout().map_index();
        for label in 0..12 as Label {
            for view in 0..2 {
                let inv = truth(view).try_inverse().unwrap();
                let normalized = apply(&inv, &ground(label)).unwrap();
                let pixel = ShapeNormalizer::denormalize_with(&shapes[&view], &normalized);
                session.store_mut().set_point(view, label, pixel);
            }
            let map_pixel = ShapeNormalizer::denormalize_with(&shapes[&map_view], &ground(label));
            session.store_mut().set_point(map_view, label, map_pixel);
        }
    }

    #[test]
    fn test_calibrate_save_and_reopen() {
        let tmp_dir = tempdir().unwrap();
        let dir = tmp_dir.path();
        let mut session = Session::with_config(dir, config()).unwrap();
        fill(&mut session);
        session.store_mut().toggle_floor(3);

        let error = session
            .calibrate(SolveRequest::Pair { view_a: 0, view_b: 1 })
            .unwrap_err();
        // A single floor label leaves too few planar points.
        assert!(matches!(error, CalibrationError::InsufficientCorrespondence(_)));
        session.store_mut().toggle_floor(3);

        let updated = session
            .calibrate(SolveRequest::Pair { view_a: 0, view_b: 1 })
            .unwrap();
        assert_eq!(updated, vec![0, 1]);
        session.save().unwrap();
        assert!(dir.join("params").join("left.json").exists());

        let reopened = Session::open(dir).unwrap();
        assert_eq!(reopened.store(), session.store());
        assert_eq!(reopened.orchestrator().params(), session.orchestrator().params());

        let evaluation = reopened.evaluate(1).unwrap();
        assert!(!evaluation.preview.is_empty());
        assert!(evaluation.error.unwrap().rmse < 1e-2);
    }

    #[test]
    fn test_open_reports_unmatched_params() {
        let tmp_dir = tempdir().unwrap();
        let dir = tmp_dir.path();
        let session = Session::with_config(dir, config()).unwrap();
        session.save().unwrap();
        fs::write(dir.join(PARAMS_DIR).join("other.json"), "[1.0]").unwrap();
        fs::write(
            dir.join(PARAMS_DIR).join("right.json"),
            serde_json::to_string(&CalibrationParams::new(vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]))
                .unwrap(),
        )
        .unwrap();

        let reopened = Session::open(dir).unwrap();
        assert_eq!(
            reopened.skipped_parameter_files(),
            &[PersistenceError::UnmatchedParameterFile("other.json".to_string())]
        );
        assert_eq!(reopened.orchestrator().calibrated(), [1].into_iter().collect());
    }

    #[test]
    fn test_clear_removes_params_on_save() {
        let tmp_dir = tempdir().unwrap();
        let dir = tmp_dir.path();
        let mut session = Session::with_config(dir, config()).unwrap();
        session
            .orchestrator_mut()
            .restore(0, CalibrationParams::new(vec![1.0; 9]))
            .unwrap();
        session.save().unwrap();
        assert!(dir.join(PARAMS_DIR).join("left.json").exists());

        assert!(session.orchestrator_mut().clear(0));
        session.save().unwrap();
        assert!(!dir.join(PARAMS_DIR).join("left.json").exists());
        assert!(Session::open(dir).unwrap().orchestrator().calibrated().is_empty());
    }

    #[test]
    fn test_open_drops_views_outside_layout() {
        let tmp_dir = tempdir().unwrap();
        let dir = tmp_dir.path();
        fs::write(
            dir.join("cam.json"),
            r#"{"point_data": {"7": {"0": [1, 2]}, "0": {"0": [5, 6]}}, "floor_points": []}"#,
        )
        .unwrap();

        let mut session = Session::with_config(dir, config()).unwrap();
        assert_eq!(session.store().views_with(0).into_iter().collect::<Vec<_>>(), vec![0]);
        assert!(session.store().points_in(7).is_empty());

        fill(&mut session);
        let updated = session
            .calibrate(SolveRequest::Pair { view_a: 0, view_b: 1 })
            .unwrap();
        assert_eq!(updated, vec![0, 1]);
    }

    #[test]
    fn test_create_in_names_folder_after_images() {
        let tmp_dir = tempdir().unwrap();
        let parent = tmp_dir.path();
        fs::create_dir(parent.join("images")).unwrap();
        image::RgbImage::new(64, 48)
            .save(parent.join("images").join("left.png"))
            .unwrap();

        let mut config = config();
        config.views[0] = ViewSpec {
            path: Some(PathBuf::from("images/left.png")),
            ..ViewSpec::default()
        };
        let session = Session::create_in(parent, config).unwrap();
        assert_eq!(session.dir(), parent.join("left_right_minimap"));
        assert!(session.dir().join(CONFIG_FILE).exists());

        let reopened = Session::open(session.dir()).unwrap();
        let left = reopened.layout().get(0).unwrap();
        assert_eq!(left.name, "left.png");
        assert_eq!(left.shape, ViewShape::new(48, 64, 3));
    }
}
