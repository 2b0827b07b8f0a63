//! HTTP router construction.

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::service::PredictionService;

/// Build the router served on one equipment's port.
pub fn build_router(service: PredictionService) -> Router {
    Router::new()
        .route("/predict", post(api::predict))
        .route("/health", get(api::health))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}
