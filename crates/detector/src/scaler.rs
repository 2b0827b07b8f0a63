use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Per-feature standardization with statistics frozen at fit time.
///
/// `transform(x)[j] = (x[j] - mean[j]) / scale[j]`, where `scale` is the
/// population standard deviation. Constant features get a scale of 1.0 so
/// they map to zero instead of dividing by zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl FeatureScaler {
    /// Compute mean and standard deviation of every column.
    ///
    /// Callers validate `data` first: non-empty, rectangular, finite.
    pub fn fit(data: &[Vec<f64>]) -> Self {
        let dim = data.first().map(Vec::len).unwrap_or(0);
        let n = data.len().max(1) as f64;

        let mut mean = vec![0.0; dim];
        for row in data {
            for (m, &v) in mean.iter_mut().zip(row) {
                *m += v;
            }
        }
        for m in mean.iter_mut() {
            *m /= n;
        }

        let mut variance = vec![0.0; dim];
        for row in data {
            for ((var, &v), &m) in variance.iter_mut().zip(row).zip(&mean) {
                let d = v - m;
                *var += d * d;
            }
        }

        let scale = variance
            .into_iter()
            .map(|var| {
                let std = (var / n).sqrt();
                if std < f64::EPSILON {
                    1.0
                } else {
                    std
                }
            })
            .collect();

        Self { mean, scale }
    }

    /// Number of features the scaler was fitted on.
    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }

    /// Standardize one vector. `x` must have [`n_features`](Self::n_features) values.
    pub fn transform(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(&self.mean)
            .zip(&self.scale)
            .map(|((&v, &m), &s)| (v - m) / s)
            .collect()
    }

    /// Reject statistics that [`fit`](Self::fit) could not have produced.
    pub fn validate(&self) -> Result<()> {
        if self.mean.is_empty() || self.mean.len() != self.scale.len() {
            return Err(ModelError::InvalidModel(format!(
                "scaler: {} means but {} scales",
                self.mean.len(),
                self.scale.len()
            )));
        }
        if self.mean.iter().any(|m| !m.is_finite())
            || self.scale.iter().any(|s| !s.is_finite() || *s <= 0.0)
        {
            return Err(ModelError::InvalidModel(
                "scaler: statistics must be finite with positive scales".to_string(),
            ));
        }
        Ok(())
    }

    pub fn transform_all(&self, data: &[Vec<f64>]) -> Vec<Vec<f64>> {
        data.iter().map(|row| self.transform(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn fit_captures_mean_and_population_std() {
        let data = vec![vec![1.0, 10.0], vec![3.0, 10.0], vec![5.0, 10.0]];
        let scaler = FeatureScaler::fit(&data);

        assert_eq!(scaler.n_features(), 2);
        assert!(approx(scaler.mean()[0], 3.0));
        assert!(approx(scaler.scale()[0], (8.0f64 / 3.0).sqrt()));
        // Constant column.
        assert!(approx(scaler.mean()[1], 10.0));
        assert!(approx(scaler.scale()[1], 1.0));
    }

    #[test]
    fn transform_centers_training_data() {
        let data = vec![vec![2.0, -4.0], vec![4.0, 0.0], vec![6.0, 4.0]];
        let scaler = FeatureScaler::fit(&data);
        let scaled = scaler.transform_all(&data);

        for j in 0..2 {
            let mean: f64 = scaled.iter().map(|r| r[j]).sum::<f64>() / 3.0;
            let var: f64 = scaled.iter().map(|r| r[j] * r[j]).sum::<f64>() / 3.0;
            assert!(approx(mean, 0.0));
            assert!(approx(var, 1.0));
        }
    }

    #[test]
    fn constant_feature_maps_to_zero() {
        let scaler = FeatureScaler::fit(&[vec![7.0], vec![7.0]]);
        assert_eq!(scaler.transform(&[7.0]), vec![0.0]);
        assert_eq!(scaler.transform(&[9.0]), vec![2.0]);
    }

    #[test]
    fn validate_rejects_zero_scale_and_length_mismatch() {
        assert!(FeatureScaler::fit(&[vec![1.0, 2.0], vec![3.0, 4.0]]).validate().is_ok());

        let zero = FeatureScaler {
            mean: vec![0.0],
            scale: vec![0.0],
        };
        assert!(zero.validate().is_err());

        let ragged = FeatureScaler {
            mean: vec![0.0, 1.0],
            scale: vec![1.0],
        };
        assert!(matches!(ragged.validate(), Err(ModelError::InvalidModel(_))));
    }
}
