//! Plane-to-plane homographies estimated with the normalized DLT.

use nalgebra::{Matrix2, Matrix3, SMatrix, Vector2, Vector3};

use crate::calibration::{CalibrationError, CalibrationParams};

/// Minimum number of point pairs that determine a homography.
pub const MIN_HOMOGRAPHY_POINTS: usize = 4;

const DEGENERACY_TOLERANCE: f64 = 1e-9;

/// Returns true when the points do not span the plane (fewer than three, or
/// all on one line).
pub fn is_degenerate(points: &[Vector2<f64>]) -> bool {
    if points.len() < 3 {
        return true;
    }
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector2::<f64>::zeros(), |acc, p| acc + p) / n;
    let cov = points.iter().fold(Matrix2::<f64>::zeros(), |acc, p| {
        let d = p - mean;
        acc + d * d.transpose()
    }) / n;

    let trace = cov.trace();
    if trace <= f64::EPSILON {
        return true;
    }
    let det = cov.determinant();
    let disc = (trace * trace / 4.0 - det).max(0.0).sqrt();
    let smallest = trace / 2.0 - disc;
    let largest = trace / 2.0 + disc;
    smallest <= DEGENERACY_TOLERANCE * largest
}

/// Similarity that moves the centroid to the origin and scales the mean
/// distance to sqrt(2).
fn conditioning_transform(points: &[Vector2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector2::<f64>::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - mean).norm()).sum::<f64>() / n;
    let scale = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(
        scale,
        0.0,
        -scale * mean.x,
        0.0,
        scale,
        -scale * mean.y,
        0.0,
        0.0,
        1.0,
    )
}

fn transform(h: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    Vector2::new(q.x / q.z, q.y / q.z)
}

/// Estimates `H` with `dst ~ H * src`, scaled so that `H[(2, 2)] == 1`.
///
/// # Errors
///
/// * [`CalibrationError::InsufficientCorrespondence`] for fewer than four
///   pairs or collinear points on either side.
/// * [`CalibrationError::UnderdeterminedSystem`] when the linear system has
///   no unique solution or the result is singular.
pub fn estimate_homography(
    src: &[Vector2<f64>],
    dst: &[Vector2<f64>],
) -> Result<Matrix3<f64>, CalibrationError> {
    if src.len() != dst.len() {
        return Err(CalibrationError::InvalidParams(
            "Number of source and destination points must match".to_string(),
        ));
    }
    if src.len() < MIN_HOMOGRAPHY_POINTS {
        return Err(CalibrationError::InsufficientCorrespondence(format!(
            "{} point pairs, need at least {}",
            src.len(),
            MIN_HOMOGRAPHY_POINTS
        )));
    }
    if is_degenerate(src) || is_degenerate(dst) {
        return Err(CalibrationError::InsufficientCorrespondence(
            "points are collinear".to_string(),
        ));
    }

    let t_src = conditioning_transform(src);
    let t_dst = conditioning_transform(dst);

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (s, d) in src.iter().zip(dst) {
        let s = transform(&t_src, s);
        let d = transform(&t_dst, d);
        let rows = [
            [-s.x, -s.y, -1.0, 0.0, 0.0, 0.0, d.x * s.x, d.x * s.y, d.x],
            [0.0, 0.0, 0.0, -s.x, -s.y, -1.0, d.y * s.x, d.y * s.y, d.y],
        ];
        for row in rows.iter() {
            for i in 0..9 {
                for j in 0..9 {
                    ata[(i, j)] += row[i] * row[j];
                }
            }
        }
    }

    let eigen = ata.symmetric_eigen();
    let mut order: Vec<usize> = (0..9).collect();
    order.sort_by(|a, b| eigen.eigenvalues[*a].total_cmp(&eigen.eigenvalues[*b]));
    let largest = eigen.eigenvalues[order[8]].abs().max(f64::EPSILON);
    if eigen.eigenvalues[order[1]].abs() <= 1e-12 * largest {
        return Err(CalibrationError::UnderdeterminedSystem(
            "homography null space is not one-dimensional".to_string(),
        ));
    }

    let h = eigen.eigenvectors.column(order[0]);
    let h_conditioned = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    let t_dst_inv = t_dst.try_inverse().ok_or_else(|| {
        CalibrationError::UnderdeterminedSystem("conditioning transform is singular".to_string())
    })?;

    normalize_scale(t_dst_inv * h_conditioned * t_src)
}

/// Rescales `h` so that its last entry is one.
pub fn normalize_scale(h: Matrix3<f64>) -> Result<Matrix3<f64>, CalibrationError> {
    let h22 = h[(2, 2)];
    if !h22.is_finite() || h22.abs() < 1e-12 {
        return Err(CalibrationError::UnderdeterminedSystem(
            "homography maps the image center to infinity".to_string(),
        ));
    }
    let h = h / h22;
    if !h.iter().all(|v| v.is_finite()) || h.determinant().abs() < 1e-12 {
        return Err(CalibrationError::UnderdeterminedSystem(
            "homography is singular".to_string(),
        ));
    }
    Ok(h)
}

/// Applies `h` to a point; `None` when the point maps to infinity.
pub fn apply(h: &Matrix3<f64>, p: &Vector2<f64>) -> Option<Vector2<f64>> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    if q.z.abs() < 1e-12 {
        return None;
    }
    let r = Vector2::new(q.x / q.z, q.y / q.z);
    r.iter().all(|v| v.is_finite()).then_some(r)
}

/// Row-major parameter blob of a homography.
pub fn to_params(h: &Matrix3<f64>) -> CalibrationParams {
    CalibrationParams::new(h.transpose().iter().copied().collect())
}

/// Reads a homography back from its row-major blob.
pub fn from_params(params: &CalibrationParams) -> Result<Matrix3<f64>, CalibrationError> {
    let v = params.values();
    if v.len() != 9 || !params.is_finite() {
        return Err(CalibrationError::InvalidParams(format!(
            "homography needs 9 finite values, got {}",
            v.len()
        )));
    }
    Ok(Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ground_truth() -> Matrix3<f64> {
        Matrix3::new(0.9, 0.1, 0.05, -0.05, 1.1, -0.1, 0.02, 0.03, 1.0)
    }

    fn grid() -> Vec<Vector2<f64>> {
        let mut points = Vec::new();
        for i in 0..3 {
            for j in 0..3 {
                points.push(Vector2::new(-0.6 + 0.5 * j as f64, -0.4 + 0.4 * i as f64));
            }
        }
        points
    }

    #[test]
    fn test_estimate_recovers_exact_homography() {
        let h_true = ground_truth();
        let src = grid();
        let dst: Vec<_> = src.iter().map(|p| apply(&h_true, p).unwrap()).collect();

        let h = estimate_homography(&src, &dst).unwrap();
        for (a, b) in h.iter().zip(h_true.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_estimate_from_four_points() {
        let h_true = ground_truth();
        let src = vec![
            Vector2::new(-0.5, -0.5),
            Vector2::new(0.5, -0.5),
            Vector2::new(0.5, 0.5),
            Vector2::new(-0.5, 0.4),
        ];
        let dst: Vec<_> = src.iter().map(|p| apply(&h_true, p).unwrap()).collect();
        let h = estimate_homography(&src, &dst).unwrap();
        for p in &src {
            let expected = apply(&h_true, p).unwrap();
            let actual = apply(&h, p).unwrap();
            assert_relative_eq!((expected - actual).norm(), 0.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_too_few_points() {
        let src = grid()[..3].to_vec();
        let result = estimate_homography(&src, &src);
        assert!(matches!(
            result,
            Err(CalibrationError::InsufficientCorrespondence(_))
        ));
    }

    #[test]
    fn test_collinear_points_rejected() {
        let src: Vec<_> = (0..5).map(|i| Vector2::new(i as f64, 2.0 * i as f64)).collect();
        assert!(is_degenerate(&src));
        let dst = grid()[..5].to_vec();
        let result = estimate_homography(&src, &dst);
        assert!(matches!(
            result,
            Err(CalibrationError::InsufficientCorrespondence(_))
        ));
    }

    #[test]
    fn test_params_round_trip_is_row_major() {
        let h = ground_truth();
        let params = to_params(&h);
        assert_eq!(params.values()[1], 0.1);
        assert_eq!(params.values()[3], -0.05);
        assert_eq!(from_params(&params).unwrap(), h);
        assert!(from_params(&CalibrationParams::new(vec![1.0; 4])).is_err());
    }
}
