use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::service::{PredictError, PredictionRequest, PredictionResponse, PredictionService};

// ── Errors ────────────────────────────────────────────────────────

/// Error body returned to clients: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<PredictError> for ApiError {
    fn from(e: PredictError) -> Self {
        match e {
            PredictError::InvalidInput(_) => Self::bad_request(e.to_string()),
            PredictError::Internal(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: e.to_string(),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

// ── Predict ───────────────────────────────────────────────────────

pub async fn predict(
    State(service): State<PredictionService>,
    payload: Result<Json<PredictionRequest>, JsonRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let Json(request) = payload?;
    match service.predict(request).await {
        Ok(prediction) => Ok(Json(PredictionResponse {
            prediction: prediction.result,
        })),
        Err(e) => {
            tracing::info!(equipment = service.equipment_id(), error = %e, "prediction rejected");
            Err(e.into())
        }
    }
}

// ── Health ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub equipment_id: String,
    pub n_features: usize,
    pub config_loaded_at: DateTime<Utc>,
    pub config_refresh_failures: u32,
}

pub async fn health(State(service): State<PredictionService>) -> Json<HealthResponse> {
    let config = service.config();
    // Still serving on a stale snapshot once refreshes keep failing.
    let status = if config.escalated() { "degraded" } else { "ok" };
    Json(HealthResponse {
        status,
        equipment_id: service.equipment_id().to_string(),
        n_features: service.model().n_features(),
        config_loaded_at: config.current().loaded_at,
        config_refresh_failures: config.consecutive_failures(),
    })
}
