pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use service_core::axum::{
    extract::State,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::MfaConfig;
use crate::services::{HealthCheck, VerificationOrchestrator};

#[derive(Clone)]
pub struct AppState {
    pub config: MfaConfig,
    pub orchestrator: Arc<VerificationOrchestrator>,
    pub health: Arc<dyn HealthCheck>,
}

pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.health.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Redis health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "redis": "up"
        }
    })))
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    // Gate runs before the body is read so refused callers never reach the engine
    let verify_route = Router::new()
        .route("/mfa/:provider/verify", post(handlers::mfa::verify))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::require_provider_access,
        ));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/mfa/providers", get(handlers::mfa::providers))
        .route("/mfa/:provider/allowed", get(handlers::mfa::allowed))
        .merge(verify_route)
        .with_state(state)
        // Add tracing layer
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        // Add tracing middleware for request_id
        .layer(from_fn(request_id_middleware));

    Ok(app)
}
