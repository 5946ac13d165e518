//! HTTP surface.
//!
//! - `GET /api/vehicle-positions` runs one pipeline pass and returns the
//!   bucket map. Always 200.
//! - `GET /health` reports broker connectivity without touching the feed.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderValue;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowHeaders, AllowMethods, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::grid::GridBucketMap;
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker_connected: bool,
}

/// The pass runs on its own task so a client that hangs up does not cancel
/// the fetch or the broker sends.
async fn vehicle_positions(State(state): State<AppState>) -> Json<GridBucketMap> {
    let pipeline = Arc::clone(&state.pipeline);
    match tokio::spawn(async move { pipeline.handle_request().await }).await {
        Ok(buckets) => Json(buckets),
        Err(e) => {
            error!(error = %e, "Pipeline pass aborted");
            Json(GridBucketMap::new())
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        broker_connected: state.pipeline.publisher().is_connected(),
    })
}

/// CORS for the map front end: one origin, with credentials. Methods and
/// headers are mirrored because wildcards are not allowed alongside
/// credentials.
fn build_cors_layer(origin: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request());

    match origin.trim().parse::<HeaderValue>() {
        Ok(value) => {
            info!(origin = %origin, "CORS: allowing configured origin");
            base.allow_origin(value).allow_credentials(true)
        }
        Err(e) => {
            warn!(origin = %origin, error = %e, "CORS origin is not a valid header value, cross-origin requests disabled");
            base
        }
    }
}

/// Creates the application router.
pub fn router(state: AppState, cors_origin: &str) -> Router {
    Router::new()
        .route("/api/vehicle-positions", get(vehicle_positions))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(cors_origin))
}
