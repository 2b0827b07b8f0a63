//! Local Outlier Factor in novelty mode.
//!
//! The detector is fitted on (scaled) normal data only and then scores new
//! points against that frozen neighbourhood structure:
//!
//! - `k-dist(p)`: distance from training point `p` to its k-th nearest
//!   neighbour (itself excluded).
//! - `reach-dist(a, b) = max(k-dist(b), d(a, b))`.
//! - `lrd(a) = 1 / (mean reach-dist(a, b) over a's k neighbours + 1e-10)`.
//! - `score(a) = -mean(lrd(b) / lrd(a))`, the negated outlier factor: values
//!   near -1 are typical, much lower values are outliers.
//!
//! The decision threshold (`offset`) is the `contamination` quantile of the
//! training scores, so roughly that share of the training set itself falls
//! below it.

use std::cmp::Ordering;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Guards `1 / mean reach-dist` against duplicate points.
const LRD_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalOutlierFactor {
    n_neighbors: usize,
    contamination: f64,
    points: Vec<Vec<f64>>,
    k_distances: Vec<f64>,
    lrd: Vec<f64>,
    offset: f64,
}

impl LocalOutlierFactor {
    /// Fit on `points`, which must hold at least two rectangular, finite rows.
    ///
    /// `n_neighbors` is clamped to `points.len() - 1`.
    pub fn fit(points: Vec<Vec<f64>>, n_neighbors: usize, contamination: f64) -> Self {
        let n = points.len();
        let k = n_neighbors.min(n.saturating_sub(1)).max(1);

        let neighbors: Vec<Vec<(f64, usize)>> = (0..n)
            .into_par_iter()
            .map(|i| nearest(&points, &points[i], k, Some(i)))
            .collect();

        let k_distances: Vec<f64> = neighbors
            .iter()
            .map(|nb| nb.last().map(|&(d, _)| d).unwrap_or(0.0))
            .collect();

        let lrd: Vec<f64> = neighbors
            .iter()
            .map(|nb| reachability_density(nb, &k_distances))
            .collect();

        let training_scores: Vec<f64> = neighbors
            .iter()
            .zip(&lrd)
            .map(|(nb, &own)| negative_outlier_factor(nb, &lrd, own))
            .collect();

        let offset = percentile(&training_scores, 100.0 * contamination);

        Self {
            n_neighbors: k,
            contamination,
            points,
            k_distances,
            lrd,
            offset,
        }
    }

    /// Number of features per point.
    pub fn n_features(&self) -> usize {
        self.points.first().map(Vec::len).unwrap_or(0)
    }

    /// Effective neighbourhood size after clamping.
    pub fn n_neighbors(&self) -> usize {
        self.n_neighbors
    }

    pub fn contamination(&self) -> f64 {
        self.contamination
    }

    /// Decision threshold on [`score_samples`](Self::score_samples).
    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn n_samples(&self) -> usize {
        self.points.len()
    }

    /// Negated local outlier factor of an unseen (scaled) point.
    pub fn score_samples(&self, x: &[f64]) -> f64 {
        let nb = nearest(&self.points, x, self.n_neighbors, None);
        let own = reachability_density(&nb, &self.k_distances);
        negative_outlier_factor(&nb, &self.lrd, own)
    }

    /// `score_samples(x) - offset`; negative means outlier.
    pub fn decision_function(&self, x: &[f64]) -> f64 {
        self.score_samples(x) - self.offset
    }

    pub fn is_outlier(&self, x: &[f64]) -> bool {
        self.decision_function(x) < 0.0
    }

    /// Check the fitted state is internally consistent.
    ///
    /// [`fit`](Self::fit) always produces a valid detector; this guards
    /// state that came from somewhere else, such as a decoded artifact.
    pub fn validate(&self) -> Result<()> {
        let n = self.points.len();
        if n < 2 {
            return Err(invalid(format!("need at least 2 training points, got {n}")));
        }
        if self.n_neighbors == 0 || self.n_neighbors >= n {
            return Err(invalid(format!(
                "n_neighbors must be in 1..{n}, got {}",
                self.n_neighbors
            )));
        }
        if self.k_distances.len() != n || self.lrd.len() != n {
            return Err(invalid(format!(
                "{n} training points but {} k-distances and {} densities",
                self.k_distances.len(),
                self.lrd.len()
            )));
        }

        let dim = self.n_features();
        if dim == 0 {
            return Err(invalid("training points have no features".to_string()));
        }
        if let Some(row) = self.points.iter().position(|p| p.len() != dim) {
            return Err(invalid(format!(
                "training point {row} has {} features, expected {dim}",
                self.points[row].len()
            )));
        }
        if self.points.iter().flatten().any(|v| !v.is_finite()) {
            return Err(invalid("training points contain non-finite values".to_string()));
        }
        if self.k_distances.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return Err(invalid("k-distances must be finite and non-negative".to_string()));
        }
        if self.lrd.iter().any(|d| !d.is_finite() || *d <= 0.0) {
            return Err(invalid("densities must be finite and positive".to_string()));
        }
        if !self.offset.is_finite() {
            return Err(invalid(format!("offset must be finite, got {}", self.offset)));
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(invalid(format!(
                "contamination must be in (0, 0.5], got {}",
                self.contamination
            )));
        }
        Ok(())
    }
}

fn invalid(reason: String) -> ModelError {
    ModelError::InvalidModel(format!("detector: {reason}"))
}

/// The `k` nearest training points to `query` as `(distance, index)`,
/// closest first, ties broken by index. `exclude` skips one training index.
fn nearest(
    points: &[Vec<f64>],
    query: &[f64],
    k: usize,
    exclude: Option<usize>,
) -> Vec<(f64, usize)> {
    let mut distances: Vec<(f64, usize)> = points
        .iter()
        .enumerate()
        .filter(|&(j, _)| Some(j) != exclude)
        .map(|(j, p)| (euclidean(query, p), j))
        .collect();

    let k = k.min(distances.len());
    if k == 0 {
        return Vec::new();
    }
    if k < distances.len() {
        distances.select_nth_unstable_by(k - 1, by_distance_then_index);
        distances.truncate(k);
    }
    distances.sort_by(by_distance_then_index);
    distances
}

fn by_distance_then_index(a: &(f64, usize), b: &(f64, usize)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

fn reachability_density(neighbors: &[(f64, usize)], k_distances: &[f64]) -> f64 {
    if neighbors.is_empty() {
        return 1.0 / LRD_EPSILON;
    }
    let total: f64 = neighbors
        .iter()
        .map(|&(d, j)| d.max(k_distances[j]))
        .sum();
    1.0 / (total / neighbors.len() as f64 + LRD_EPSILON)
}

fn negative_outlier_factor(neighbors: &[(f64, usize)], lrd: &[f64], own_lrd: f64) -> f64 {
    if neighbors.is_empty() {
        return -1.0;
    }
    let ratio_sum: f64 = neighbors.iter().map(|&(_, j)| lrd[j] / own_lrd).sum();
    -(ratio_sum / neighbors.len() as f64)
}

/// Linear-interpolated percentile, `q` in `[0, 100]`.
fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 11x11 grid over [-1, 1]², step 0.2.
    fn grid() -> Vec<Vec<f64>> {
        let mut points = Vec::new();
        for i in 0..11 {
            for j in 0..11 {
                points.push(vec![i as f64 * 0.2 - 1.0, j as f64 * 0.2 - 1.0]);
            }
        }
        points
    }

    #[test]
    fn percentile_interpolates() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 100.0), 4.0);
        assert!((percentile(&values, 50.0) - 2.5).abs() < 1e-12);
        assert!((percentile(&values, 10.0) - 1.3).abs() < 1e-12);
    }

    #[test]
    fn nearest_excludes_self_and_orders_by_distance() {
        let points = vec![vec![0.0], vec![1.0], vec![3.0], vec![0.5]];
        let nb = nearest(&points, &points[0], 2, Some(0));
        assert_eq!(nb.iter().map(|&(_, j)| j).collect::<Vec<_>>(), vec![3, 1]);
    }

    #[test]
    fn center_of_training_cloud_is_inlier() {
        let lof = LocalOutlierFactor::fit(grid(), 20, 0.1);
        assert_eq!(lof.n_neighbors(), 20);
        assert!(!lof.is_outlier(&[0.0, 0.0]));
        assert!(!lof.is_outlier(&[0.1, -0.1]));
    }

    #[test]
    fn distant_point_is_outlier() {
        let lof = LocalOutlierFactor::fit(grid(), 20, 0.1);
        assert!(lof.is_outlier(&[50.0, 50.0]));
        assert!(lof.score_samples(&[50.0, 50.0]) < lof.score_samples(&[0.0, 0.0]));
    }

    #[test]
    fn interior_points_score_near_minus_one() {
        let lof = LocalOutlierFactor::fit(grid(), 20, 0.1);
        let score = lof.score_samples(&[0.0, 0.0]);
        assert!((score + 1.0).abs() < 0.2, "score was {score}");
    }

    #[test]
    fn higher_contamination_raises_threshold() {
        let loose = LocalOutlierFactor::fit(grid(), 20, 0.05);
        let strict = LocalOutlierFactor::fit(grid(), 20, 0.4);
        assert!(strict.offset() >= loose.offset());
    }

    #[test]
    fn neighbors_clamped_for_small_training_sets() {
        let lof = LocalOutlierFactor::fit(vec![vec![0.0], vec![1.0], vec![2.0]], 20, 0.1);
        assert_eq!(lof.n_neighbors(), 2);
        assert!(lof.score_samples(&[1.0]).is_finite());
    }

    #[test]
    fn fitted_detector_is_valid() {
        assert!(LocalOutlierFactor::fit(grid(), 20, 0.1).validate().is_ok());
        let tiny = LocalOutlierFactor::fit(vec![vec![0.0], vec![1.0]], 20, 0.1);
        assert!(tiny.validate().is_ok());
    }

    #[test]
    fn validate_rejects_tampered_state() {
        let fitted = LocalOutlierFactor::fit(grid(), 20, 0.1);

        let mut short = fitted.clone();
        short.lrd.truncate(1);
        short.k_distances.truncate(1);
        assert!(matches!(short.validate(), Err(ModelError::InvalidModel(_))));

        let mut nan_offset = fitted.clone();
        nan_offset.offset = f64::NAN;
        assert!(nan_offset.validate().is_err());

        let mut too_many = fitted.clone();
        too_many.n_neighbors = fitted.n_samples();
        assert!(too_many.validate().is_err());

        let mut ragged = fitted;
        ragged.points[3].push(0.0);
        assert!(ragged.validate().is_err());
    }

    #[test]
    fn duplicate_training_points_stay_finite() {
        let points = vec![vec![1.0, 1.0]; 5];
        let lof = LocalOutlierFactor::fit(points, 3, 0.1);
        assert!(lof.score_samples(&[1.0, 1.0]).is_finite());
        assert!(lof.is_outlier(&[2.0, 2.0]));
    }
}
