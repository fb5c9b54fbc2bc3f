//! Joint Levenberg-Marquardt refinement of camera-to-ground homographies.
//!
//! Each camera contributes one 8-dimensional variable (the homography with
//! its last entry fixed to one). Two kinds of residual blocks tie them to the
//! data:
//! * ground blocks: camera point mapped through `H_v` minus the map point,
//! * transfer blocks: for a label seen by two cameras but not by the map,
//!   `H_u(p_u) - H_v(p_v)`.

use log::{debug, info};
use nalgebra::{DVector, Matrix3, RealField, Vector2};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use super::is_planar;
use crate::calibration::CalibrationError;
use crate::correspondence::{Label, PointData};
use crate::geometry::homography::normalize_scale;
use crate::view::View;

const HOMOGRAPHY_DOF: usize = 8;

fn map_point<T: RealField>(h: &DVector<T>, p: &Vector2<f64>) -> (T, T) {
    let x: T = nalgebra::convert(p.x);
    let y: T = nalgebra::convert(p.y);
    let w = h[6].clone() * x.clone() + h[7].clone() * y.clone() + T::one();
    let u = (h[0].clone() * x.clone() + h[1].clone() * y.clone() + h[2].clone()) / w.clone();
    let v = (h[3].clone() * x + h[4].clone() * y + h[5].clone()) / w;
    (u, v)
}

/// Camera points against their observed map positions.
#[derive(Debug, Clone)]
struct GroundCost {
    camera: Vec<Vector2<f64>>,
    ground: Vec<Vector2<f64>>,
}

impl<T: RealField> Factor<T> for GroundCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let h = &params[0];
        let mut residuals = DVector::zeros(self.camera.len() * 2);
        for (i, (p, q)) in self.camera.iter().zip(&self.ground).enumerate() {
            let (u, v) = map_point(h, p);
            residuals[i * 2] = u - nalgebra::convert::<f64, T>(q.x);
            residuals[i * 2 + 1] = v - nalgebra::convert::<f64, T>(q.y);
        }
        residuals
    }
}

/// The same labels seen from two cameras must land on the same ground point.
#[derive(Debug, Clone)]
struct TransferCost {
    first: Vec<Vector2<f64>>,
    second: Vec<Vector2<f64>>,
}

impl<T: RealField> Factor<T> for TransferCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let h_first = &params[0];
        let h_second = &params[1];
        let mut residuals = DVector::zeros(self.first.len() * 2);
        for (i, (p, q)) in self.first.iter().zip(&self.second).enumerate() {
            let (u1, v1) = map_point(h_first, p);
            let (u2, v2) = map_point(h_second, q);
            residuals[i * 2] = u1 - u2;
            residuals[i * 2 + 1] = v1 - v2;
        }
        residuals
    }
}

fn variable_key(view: View) -> String {
    format!("h{view}")
}

fn to_variable(h: &Matrix3<f64>) -> DVector<f64> {
    DVector::from_vec(vec![
        h[(0, 0)],
        h[(0, 1)],
        h[(0, 2)],
        h[(1, 0)],
        h[(1, 1)],
        h[(1, 2)],
        h[(2, 0)],
        h[(2, 1)],
    ])
}

fn from_variable(v: &DVector<f64>) -> Result<Matrix3<f64>, CalibrationError> {
    if v.len() != HOMOGRAPHY_DOF {
        return Err(CalibrationError::UnderdeterminedSystem(format!(
            "expected {HOMOGRAPHY_DOF} homography entries, got {}",
            v.len()
        )));
    }
    normalize_scale(Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], 1.0))
}

/// Collects `(view_a point, view_b point)` pairs for the planar labels both
/// views observe, optionally skipping labels also seen by `exclude`.
fn paired_points(
    data: &PointData,
    view_a: View,
    view_b: View,
    exclude: Option<View>,
    floor_points: &BTreeSet<Label>,
) -> (Vec<Vector2<f64>>, Vec<Vector2<f64>>) {
    let (Some(a), Some(b)) = (data.get(&view_a), data.get(&view_b)) else {
        return (Vec::new(), Vec::new());
    };
    let excluded = exclude.and_then(|view| data.get(&view));
    a.iter()
        .filter(|(label, _)| is_planar(**label, floor_points))
        .filter(|(label, _)| excluded.map_or(true, |points| !points.contains_key(*label)))
        .filter_map(|(label, pa)| b.get(label).map(|pb| (*pa, *pb)))
        .unzip()
}

/// Refines the homographies in `initial` against every correspondence in
/// `data` that involves them.
///
/// # Errors
///
/// [`CalibrationError::UnderdeterminedSystem`] when some camera is not tied to
/// the map (directly or through other cameras), when there are fewer residuals
/// than unknowns, or when the optimizer fails.
pub fn refine_homographies(
    initial: &BTreeMap<View, Matrix3<f64>>,
    data: &PointData,
    map_view: View,
    floor_points: &BTreeSet<Label>,
) -> Result<BTreeMap<View, Matrix3<f64>>, CalibrationError> {
    if initial.is_empty() {
        return Err(CalibrationError::UnderdeterminedSystem(
            "no homographies to refine".to_string(),
        ));
    }

    let mut problem = tiny_solver::Problem::new();
    let mut num_residuals = 0;
    let mut anchored: BTreeSet<View> = BTreeSet::new();
    let mut edges: BTreeMap<View, BTreeSet<View>> = BTreeMap::new();

    for view in initial.keys() {
        let (camera, ground) = paired_points(data, *view, map_view, None, floor_points);
        if camera.is_empty() {
            continue;
        }
        let key = variable_key(*view);
        let rows = camera.len() * 2;
        problem.add_residual_block(rows, &[key.as_str()], Box::new(GroundCost { camera, ground }), None);
        num_residuals += rows;
        anchored.insert(*view);
    }

    let views: Vec<View> = initial.keys().copied().collect();
    for (i, first) in views.iter().enumerate() {
        for second in &views[i + 1..] {
            let (p, q) = paired_points(data, *first, *second, Some(map_view), floor_points);
            if p.is_empty() {
                continue;
            }
            let keys = [variable_key(*first), variable_key(*second)];
            let rows = p.len() * 2;
            problem.add_residual_block(
                rows,
                &[keys[0].as_str(), keys[1].as_str()],
                Box::new(TransferCost {
                    first: p,
                    second: q,
                }),
                None,
            );
            num_residuals += rows;
            edges.entry(*first).or_default().insert(*second);
            edges.entry(*second).or_default().insert(*first);
        }
    }

    // Every camera needs a path of residual blocks to the map.
    let mut reached = anchored.clone();
    let mut queue: VecDeque<View> = anchored.iter().copied().collect();
    while let Some(view) = queue.pop_front() {
        for next in edges.get(&view).into_iter().flatten() {
            if reached.insert(*next) {
                queue.push_back(*next);
            }
        }
    }
    let unreached: Vec<View> = views.iter().filter(|v| !reached.contains(v)).copied().collect();
    if !unreached.is_empty() {
        return Err(CalibrationError::UnderdeterminedSystem(format!(
            "views {unreached:?} share no ground-plane correspondences"
        )));
    }

    let num_unknowns = views.len() * HOMOGRAPHY_DOF;
    if num_residuals < num_unknowns {
        return Err(CalibrationError::UnderdeterminedSystem(format!(
            "{num_residuals} residuals for {num_unknowns} unknowns"
        )));
    }

    let initial_values: HashMap<String, DVector<f64>> = initial
        .iter()
        .map(|(view, h)| (variable_key(*view), to_variable(h)))
        .collect();

    debug!(
        "Refining {} homographies with {} residuals",
        views.len(),
        num_residuals
    );

    let optimizer = LevenbergMarquardtOptimizer::default();
    let result = optimizer
        .optimize(&problem, &initial_values, None)
        .ok_or_else(|| {
            CalibrationError::UnderdeterminedSystem("optimization did not converge".to_string())
        })?;

    let mut refined = BTreeMap::new();
    for view in &views {
        let values = result.get(&variable_key(*view)).ok_or_else(|| {
            CalibrationError::UnderdeterminedSystem(format!("no estimate for view {view}"))
        })?;
        refined.insert(*view, from_variable(values)?);
    }

    info!("Refined homographies of views {views:?}");
    Ok(refined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::homography::apply;
    use approx::assert_relative_eq;

    fn truth(view: View) -> Matrix3<f64> {
        match view {
            0 => Matrix3::new(0.8, 0.1, 0.1, -0.05, 0.9, 0.2, 0.05, 0.1, 1.0),
            _ => Matrix3::new(1.1, -0.2, -0.1, 0.1, 1.0, 0.05, -0.05, 0.08, 1.0),
        }
    }

    fn scene(map_labels: std::ops::Range<Label>, all_labels: std::ops::Range<Label>) -> PointData {
        let mut data = PointData::new();
        for label in all_labels {
            let ground = Vector2::new(
                -0.5 + 0.25 * (label % 5) as f64,
                -0.4 + 0.3 * (label / 5) as f64,
            );
            for view in 0..2 {
                let inv = truth(view).try_inverse().unwrap();
                let pixel = apply(&inv, &ground).unwrap();
                data.entry(view).or_default().insert(label, pixel);
            }
            if map_labels.contains(&label) {
                data.entry(2).or_default().insert(label, ground);
            }
        }
        data
    }

    fn ground_rms(hs: &BTreeMap<View, Matrix3<f64>>, data: &PointData) -> f64 {
        let mut sum = 0.0;
        let mut n = 0;
        for (view, h) in hs {
            for (label, pixel) in &data[view] {
                if let Some(ground) = data[&2].get(label) {
                    sum += (apply(h, pixel).unwrap() - ground).norm_squared();
                    n += 1;
                }
            }
        }
        (sum / n as f64).sqrt()
    }

    #[test]
    fn test_refine_converges_from_perturbed_start() {
        let data = scene(0..10, 0..20);
        let mut initial = BTreeMap::new();
        for view in 0..2 {
            let mut h = truth(view);
            h[(0, 0)] += 0.02;
            h[(1, 2)] -= 0.01;
            initial.insert(view, h);
        }

        let refined = refine_homographies(&initial, &data, 2, &BTreeSet::new()).unwrap();
        let before = ground_rms(&initial, &data);
        let after = ground_rms(&refined, &data);
        assert!(after < 0.5 * before, "rms {after} not below {before}");
        assert!(after < 5e-3, "rms {after} too large");
        for view in 0..2 {
            assert_relative_eq!(refined[&view][(2, 2)], 1.0);
        }
    }

    #[test]
    fn test_refine_rejects_view_without_ground_link() {
        let mut data = scene(0..10, 0..10);
        data.remove(&1);
        data.entry(1).or_default().insert(40, Vector2::new(0.1, 0.1));
        let initial: BTreeMap<_, _> = (0..2).map(|v| (v, truth(v))).collect();
        let result = refine_homographies(&initial, &data, 2, &BTreeSet::new());
        assert!(matches!(
            result,
            Err(CalibrationError::UnderdeterminedSystem(_))
        ));
    }

    #[test]
    fn test_transfer_links_view_without_map_points() {
        // View 1 sees no map label directly but shares labels with view 0.
        let mut data = scene(0..10, 0..20);
        let map_labels: Vec<Label> = data[&2].keys().copied().collect();
        let view1 = data.get_mut(&1).unwrap();
        for label in map_labels {
            view1.remove(&label);
        }
        let initial: BTreeMap<_, _> = (0..2).map(|v| (v, truth(v))).collect();
        let refined = refine_homographies(&initial, &data, 2, &BTreeSet::new()).unwrap();
        assert_eq!(refined.len(), 2);
    }
}
