use ndarray::{Array1, Array2};
use serde_derive::{Deserialize, Serialize};

/// Linear correction stored in a channel: true voltage = slope * measured + offset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub slope: f64,
    pub offset: f64,
    pub discriminator: f64,
}

/// Mean of the samples after dropping the single smallest and single largest one
pub fn trimmed_mean(samples: &[f64]) -> Option<f64> {
    if samples.len() < 3 {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let kept = &sorted[1..sorted.len() - 1];
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Ordinary least squares fit of target = slope * measured + offset, solved in closed form
/// through the normal equations (A^T A) x = A^T y with A = [measured, 1].
/// Returns None when the system is singular (fewer than two distinct measured values).
pub fn linear_regression(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len();
    if n < 2 {
        return None;
    }

    let mut a = Array2::<f64>::ones((n, 2));
    let mut y = Array1::<f64>::zeros(n);
    for (row, (measured, target)) in points.iter().enumerate() {
        a[[row, 0]] = *measured;
        y[row] = *target;
    }

    let ata = a.t().dot(&a);
    let aty = a.t().dot(&y);
    let det = ata[[0, 0]] * ata[[1, 1]] - ata[[0, 1]] * ata[[1, 0]];
    if det.abs() <= f64::EPSILON * ata[[0, 0]] * ata[[1, 1]] {
        return None;
    }

    let slope = (ata[[1, 1]] * aty[0] - ata[[0, 1]] * aty[1]) / det;
    let offset = (ata[[0, 0]] * aty[1] - ata[[1, 0]] * aty[0]) / det;
    Some((slope, offset))
}
