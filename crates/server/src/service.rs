//! Per-equipment prediction: validate, scale, score, label, alert.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use watchpost_core::ConfigStore;
use watchpost_detector::{EquipmentModel, Label, ModelError};
use watchpost_notify::{Alert, AlertDispatcher, ANOMALY_MESSAGE};

/// Labels aligned with the rows of a [`PredictionRequest`].
pub type PredictionResult = Vec<Label>;

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionRequest {
    pub data: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub prediction: PredictionResult,
}

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The scoring task died before producing labels.
    #[error("scoring failed: {0}")]
    Internal(String),
}

impl From<ModelError> for PredictError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::DimensionMismatch { .. } | ModelError::NonFinite { .. } => {
                PredictError::InvalidInput(e.to_string())
            }
            other => PredictError::Internal(other.to_string()),
        }
    }
}

/// Labels for one batch plus the alert it triggered, if any.
///
/// The alert runs in the background; callers that care about its completion
/// (tests) can await the handle, the HTTP layer simply drops it. Dropping
/// the handle does not cancel delivery.
#[derive(Debug)]
pub struct Prediction {
    pub result: PredictionResult,
    pub alert: Option<JoinHandle<()>>,
}

/// Scores feature vectors for a single piece of equipment.
#[derive(Clone)]
pub struct PredictionService {
    equipment_id: Arc<str>,
    model: Arc<EquipmentModel>,
    config: Arc<ConfigStore>,
    dispatcher: Arc<AlertDispatcher>,
}

impl PredictionService {
    pub fn new(
        equipment_id: impl Into<String>,
        model: Arc<EquipmentModel>,
        config: Arc<ConfigStore>,
        dispatcher: Arc<AlertDispatcher>,
    ) -> Self {
        Self {
            equipment_id: Arc::from(equipment_id.into()),
            model,
            config,
            dispatcher,
        }
    }

    pub fn equipment_id(&self) -> &str {
        &self.equipment_id
    }

    pub fn model(&self) -> &EquipmentModel {
        &self.model
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Label every row of `request`. Pure: no alert, no I/O.
    pub fn classify(&self, request: &PredictionRequest) -> Result<PredictionResult, PredictError> {
        if request.data.is_empty() {
            return Err(PredictError::InvalidInput(
                "data must contain at least one feature vector".to_string(),
            ));
        }
        Ok(self.model.classify(&request.data)?)
    }

    /// Classify on the blocking pool, then raise at most one alert for the
    /// batch if any row is an outlier. Labels never wait on the alert.
    pub async fn predict(&self, request: PredictionRequest) -> Result<Prediction, PredictError> {
        let start = Instant::now();
        let rows = request.data.len();

        let service = self.clone();
        let result = tokio::task::spawn_blocking(move || service.classify(&request))
            .await
            .map_err(|e| PredictError::Internal(e.to_string()))??;

        let outliers = result.iter().filter(|l| **l == Label::Outlier).count();
        debug!(
            equipment = %self.equipment_id,
            rows,
            outliers,
            duration_ms = start.elapsed().as_millis() as u64,
            "batch scored"
        );

        let alert = (outliers > 0).then(|| self.spawn_alert());
        Ok(Prediction { result, alert })
    }

    fn spawn_alert(&self) -> JoinHandle<()> {
        // Settings are fixed now; a refresh during delivery does not affect it.
        // The dispatcher tracks the task so shutdown can wait for it.
        self.dispatcher.spawn_dispatch(
            Alert::new(ANOMALY_MESSAGE, &*self.equipment_id),
            self.config.current(),
        )
    }
}

impl std::fmt::Debug for PredictionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionService")
            .field("equipment_id", &self.equipment_id)
            .field("n_features", &self.model.n_features())
            .finish_non_exhaustive()
    }
}
