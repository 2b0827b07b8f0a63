//! Per-equipment anomaly prediction over HTTP.
//!
//! - `service`: `PredictionService`, the validate/scale/score/label/alert path
//! - `api` + `router`: axum handlers for `POST /predict` and `GET /health`
//! - `supervisor`: config refresh loop plus one service task per equipment

pub mod api;
pub mod router;
pub mod service;
pub mod supervisor;

pub use router::build_router;
pub use service::{
    PredictError, Prediction, PredictionRequest, PredictionResponse, PredictionResult,
    PredictionService,
};
pub use supervisor::{
    shutdown_signal, ServiceExit, ServiceOutcome, Supervisor, SupervisorReport, ALERT_DRAIN_TIMEOUT,
    REFRESH_RESTART_DELAY,
};
