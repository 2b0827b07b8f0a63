use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::info;

use crate::error::{ModelError, Result};
use crate::lof::LocalOutlierFactor;
use crate::scaler::FeatureScaler;

/// Classification of one feature vector. Serialized as `1` / `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Inlier,
    Outlier,
}

impl Label {
    pub fn as_i8(self) -> i8 {
        match self {
            Label::Inlier => 1,
            Label::Outlier => -1,
        }
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.as_i8())
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match i8::deserialize(deserializer)? {
            1 => Ok(Label::Inlier),
            -1 => Ok(Label::Outlier),
            other => Err(serde::de::Error::custom(format!(
                "label must be 1 or -1, got {other}"
            ))),
        }
    }
}

/// Training knobs for [`train`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainParams {
    /// Neighbourhood size for the LOF detector.
    pub n_neighbors: usize,
    /// Expected share of outliers in the training data, in `(0, 0.5]`.
    pub contamination: f64,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            n_neighbors: 20,
            contamination: 0.1,
        }
    }
}

/// A fitted scaler/detector pair bound to one piece of equipment.
///
/// The detector was fitted on the scaler's output, so the two are only ever
/// used together and are never modified after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct EquipmentModel {
    equipment_id: String,
    scaler: FeatureScaler,
    detector: LocalOutlierFactor,
}

impl EquipmentModel {
    pub fn new(
        equipment_id: impl Into<String>,
        scaler: FeatureScaler,
        detector: LocalOutlierFactor,
    ) -> Result<Self> {
        if scaler.n_features() != detector.n_features() {
            return Err(ModelError::Inconsistent {
                scaler: scaler.n_features(),
                detector: detector.n_features(),
            });
        }
        scaler.validate()?;
        detector.validate()?;
        Ok(Self {
            equipment_id: equipment_id.into(),
            scaler,
            detector,
        })
    }

    pub fn equipment_id(&self) -> &str {
        &self.equipment_id
    }

    /// Feature count every input vector must have.
    pub fn n_features(&self) -> usize {
        self.scaler.n_features()
    }

    pub fn scaler(&self) -> &FeatureScaler {
        &self.scaler
    }

    pub fn detector(&self) -> &LocalOutlierFactor {
        &self.detector
    }

    /// Check every row has the expected length and only finite values.
    pub fn validate(&self, rows: &[Vec<f64>]) -> Result<()> {
        let expected = self.n_features();
        for (row, values) in rows.iter().enumerate() {
            if values.len() != expected {
                return Err(ModelError::DimensionMismatch {
                    row,
                    expected,
                    got: values.len(),
                });
            }
            if values.iter().any(|v| !v.is_finite()) {
                return Err(ModelError::NonFinite { row });
            }
        }
        Ok(())
    }

    /// Decision value of one raw vector: negative means outlier.
    pub fn score(&self, x: &[f64]) -> f64 {
        self.detector.decision_function(&self.scaler.transform(x))
    }

    /// Scale and label a batch, positionally aligned with `rows`.
    pub fn classify(&self, rows: &[Vec<f64>]) -> Result<Vec<Label>> {
        self.validate(rows)?;
        Ok(rows
            .iter()
            .map(|x| {
                if self.score(x) < 0.0 {
                    Label::Outlier
                } else {
                    Label::Inlier
                }
            })
            .collect())
    }

    pub(crate) fn into_parts(self) -> (String, FeatureScaler, LocalOutlierFactor) {
        (self.equipment_id, self.scaler, self.detector)
    }
}

/// Fit a scaler on `data`, then a LOF novelty detector on the scaled data.
///
/// This is the offline half of the system; the result is persisted with
/// [`ModelStore::save`](crate::ModelStore::save).
pub fn train(
    equipment_id: impl Into<String>,
    data: &[Vec<f64>],
    params: TrainParams,
) -> Result<EquipmentModel> {
    let equipment_id = equipment_id.into();
    validate_training(data, &params)?;

    let scaler = FeatureScaler::fit(data);
    let scaled = scaler.transform_all(data);
    let detector = LocalOutlierFactor::fit(scaled, params.n_neighbors, params.contamination);

    info!(
        equipment = %equipment_id,
        samples = data.len(),
        features = scaler.n_features(),
        n_neighbors = detector.n_neighbors(),
        contamination = params.contamination,
        offset = detector.offset(),
        "model trained"
    );

    EquipmentModel::new(equipment_id, scaler, detector)
}

fn validate_training(data: &[Vec<f64>], params: &TrainParams) -> Result<()> {
    if params.n_neighbors == 0 {
        return Err(ModelError::InvalidTraining(
            "n_neighbors must be at least 1".to_string(),
        ));
    }
    if !(params.contamination > 0.0 && params.contamination <= 0.5) {
        return Err(ModelError::InvalidTraining(format!(
            "contamination must be in (0, 0.5], got {}",
            params.contamination
        )));
    }
    if data.len() < 2 {
        return Err(ModelError::InvalidTraining(format!(
            "need at least 2 samples, got {}",
            data.len()
        )));
    }

    let dim = data[0].len();
    if dim == 0 {
        return Err(ModelError::InvalidTraining(
            "feature vectors must not be empty".to_string(),
        ));
    }
    for (i, row) in data.iter().enumerate() {
        if row.len() != dim {
            return Err(ModelError::InvalidTraining(format!(
                "sample {i} has {} features, expected {dim}",
                row.len()
            )));
        }
        if row.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::InvalidTraining(format!(
                "sample {i} contains a non-finite value"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Dense cloud around the origin: 11x11 grid over [-1, 1]².
    fn normal_cloud() -> Vec<Vec<f64>> {
        (0..11)
            .flat_map(|i| (0..11).map(move |j| vec![i as f64 * 0.2 - 1.0, j as f64 * 0.2 - 1.0]))
            .collect()
    }

    #[test]
    fn label_encodes_as_sign() {
        assert_eq!(Label::Inlier.as_i8(), 1);
        assert_eq!(Label::Outlier.as_i8(), -1);

        let encoded = rmp_serde::to_vec(&[Label::Outlier, Label::Inlier]).unwrap();
        let decoded: Vec<i8> = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(decoded, vec![-1, 1]);

        let zero = rmp_serde::to_vec(&0i8).unwrap();
        assert!(rmp_serde::from_slice::<Label>(&zero).is_err());
    }

    #[test]
    fn trained_model_separates_origin_from_far_point() {
        let model = train("equipment1", &normal_cloud(), TrainParams::default()).unwrap();
        let labels = model.classify(&[vec![0.0, 0.0], vec![100.0, 100.0]]).unwrap();
        assert_eq!(labels, vec![Label::Inlier, Label::Outlier]);
        assert_eq!(model.equipment_id(), "equipment1");
        assert_eq!(model.n_features(), 2);
    }

    #[test]
    fn classify_rejects_wrong_dimension() {
        let model = train("eq", &normal_cloud(), TrainParams::default()).unwrap();
        let err = model.classify(&[vec![0.0, 0.0], vec![1.0]]).unwrap_err();
        assert!(matches!(
            err,
            ModelError::DimensionMismatch { row: 1, expected: 2, got: 1 }
        ));
    }

    #[test]
    fn classify_rejects_non_finite() {
        let model = train("eq", &normal_cloud(), TrainParams::default()).unwrap();
        let err = model.classify(&[vec![f64::NAN, 0.0]]).unwrap_err();
        assert!(matches!(err, ModelError::NonFinite { row: 0 }));
    }

    #[test]
    fn train_rejects_bad_input() {
        let params = TrainParams::default();
        assert!(train("eq", &[], params).is_err());
        assert!(train("eq", &[vec![1.0]], params).is_err());
        assert!(train("eq", &[vec![1.0, 2.0], vec![1.0]], params).is_err());
        assert!(train("eq", &[vec![1.0], vec![f64::INFINITY]], params).is_err());

        let bad_contamination = TrainParams {
            contamination: 0.7,
            ..params
        };
        assert!(train("eq", &normal_cloud(), bad_contamination).is_err());

        let zero_neighbors = TrainParams {
            n_neighbors: 0,
            ..params
        };
        assert!(train("eq", &normal_cloud(), zero_neighbors).is_err());
    }

    #[test]
    fn mismatched_parts_are_rejected() {
        let scaler = FeatureScaler::fit(&[vec![0.0, 1.0, 2.0], vec![1.0, 2.0, 3.0]]);
        let detector = LocalOutlierFactor::fit(vec![vec![0.0, 1.0], vec![1.0, 2.0]], 1, 0.1);
        let err = EquipmentModel::new("eq", scaler, detector).unwrap_err();
        assert!(matches!(err, ModelError::Inconsistent { scaler: 3, detector: 2 }));
    }
}
