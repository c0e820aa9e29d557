//! Governance HTTP API.
//!
//! Routes:
//! - POST /v1/requests
//! - POST /v1/nodes/{name}/heartbeat
//! - POST /v1/models
//! - POST /v1/actors/{actor}/trust
//! - POST /v1/budgets/reset
//! - GET  /v1/dashboard
//! - GET  /health

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::budget::ledger::PeriodStats;
use crate::cache::layer::LayerSpec;
use crate::config::Config;
use crate::error::GovernorError;
use crate::firewall::request::{CapacityRequest, Intent};
use crate::governor::{Governor, GovernorDashboard, Grant};
use crate::router::node::Heartbeat;

/// Application state shared across handlers.
pub struct AppState {
    pub governor: Arc<Governor>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/requests", post(submit_request))
        .route("/v1/nodes/{name}/heartbeat", post(node_heartbeat))
        .route("/v1/models", post(register_model))
        .route("/v1/actors/{actor}/trust", post(set_trust))
        .route("/v1/budgets/reset", post(reset_budgets))
        .route("/v1/dashboard", get(dashboard))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Capacity request body. The intent is a tag string; anything unrecognized
/// is classified as unknown, not rejected at parse time.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub intent: String,
    pub resource: String,
    pub actor: String,
    pub capacity_mb: u64,
    #[serde(default = "default_duration")]
    pub estimated_duration_secs: f64,
    #[serde(default)]
    pub parent_token: Option<String>,
}

fn default_duration() -> f64 {
    60.0
}

#[derive(Debug, Deserialize)]
pub struct RegisterModelRequest {
    pub name: String,
    pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Deserialize)]
pub struct TrustRequest {
    pub score: f64,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub chain_valid: bool,
}

/// JSON error body for every failure path.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// Map the error taxonomy onto HTTP statuses.
struct ApiError(GovernorError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GovernorError::PolicyDenied { .. } => StatusCode::FORBIDDEN,
            GovernorError::CapacityExhausted { .. } => StatusCode::INSUFFICIENT_STORAGE,
            GovernorError::NoNodeAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GovernorError::UnknownResource(_) => StatusCode::NOT_FOUND,
            GovernorError::Integrity { .. } | GovernorError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let remediation = match &self.0 {
            GovernorError::PolicyDenied { remediation, .. } => Some(remediation.clone()),
            _ => None,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
            recoverable: self.0.is_recoverable(),
            remediation,
        };
        (status, Json(body)).into_response()
    }
}

impl From<GovernorError> for ApiError {
    fn from(e: GovernorError) -> Self {
        ApiError(e)
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn submit_request(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<Grant>, ApiError> {
    info!(
        actor = %req.actor,
        resource = %req.resource,
        intent = %req.intent,
        capacity_mb = req.capacity_mb,
        "Capacity request"
    );

    let request = CapacityRequest {
        intent: Intent::from_tag(&req.intent),
        resource: req.resource,
        actor: req.actor,
        capacity_mb: req.capacity_mb,
        estimated_duration_secs: req.estimated_duration_secs,
        parent_token: req.parent_token,
    };

    let grant = state.governor.admit(request).await?;
    Ok(Json(grant))
}

async fn node_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(hb): Json<Heartbeat>,
) -> Result<Json<AckResponse>, StatusCode> {
    if state.governor.heartbeat(&name, &hb).await {
        Ok(Json(AckResponse { ok: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn register_model(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterModelRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    info!(model = %req.name, layers = req.layers.len(), "Model registration");
    state.governor.register_model(&req.name, &req.layers).await?;
    Ok(Json(AckResponse { ok: true }))
}

async fn set_trust(
    State(state): State<Arc<AppState>>,
    Path(actor): Path<String>,
    Json(req): Json<TrustRequest>,
) -> Json<AckResponse> {
    state.governor.set_trust(&actor, req.score).await;
    Json(AckResponse { ok: true })
}

async fn reset_budgets(State(state): State<Arc<AppState>>) -> Json<PeriodStats> {
    Json(state.governor.reset_budgets().await)
}

async fn dashboard(State(state): State<Arc<AppState>>) -> Json<GovernorDashboard> {
    Json(state.governor.dashboard().await)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        chain_valid: state.governor.verify_chain().await.is_ok(),
    })
}
