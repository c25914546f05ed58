use crate::error::CastorError;
use crate::failover::SwitchOutcome;
use crate::server::router::CastorState;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use castor_schema::{DatabaseStatusResponse, FailoverResponse, HealthResponse, HealthStatus};
use chrono::Utc;
use tracing::info;

/// Unauthenticated liveness endpoint.
pub fn public_router() -> Router<CastorState> {
    Router::new().route("/health", get(health_handler))
}

pub fn admin_router() -> Router<CastorState> {
    Router::new()
        .route("/health/database", get(database_status_handler))
        .route("/health/failover", post(failover_handler))
        .route("/health/failback", post(failback_handler))
}

/// GET /health
///
/// Probes the active database. Never changes the active role.
pub async fn health_handler(State(state): State<CastorState>) -> impl IntoResponse {
    let probe = state.failover.probe_active().await;
    let body = HealthResponse {
        status: if probe.is_healthy() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        },
        database: state.failover.current_role(),
        timestamp: Utc::now(),
        failover_enabled: state.failover.failover_enabled(),
        error: probe.error().map(str::to_string),
    };
    let status = if probe.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// GET /health/database
pub async fn database_status_handler(
    State(state): State<CastorState>,
) -> Json<DatabaseStatusResponse> {
    Json(state.failover.status().await)
}

/// POST /health/failover
pub async fn failover_handler(
    State(state): State<CastorState>,
) -> Result<Json<FailoverResponse>, CastorError> {
    if !state.failover.failover_enabled() {
        return Err(CastorError::FailoverDisabled);
    }
    info!("operator requested failover to mirror");
    let outcome = state.failover.switch_to_mirror().await?;
    Ok(Json(respond(&state, outcome, "switched to mirror", "already on mirror")))
}

/// POST /health/failback
pub async fn failback_handler(
    State(state): State<CastorState>,
) -> Result<Json<FailoverResponse>, CastorError> {
    info!("operator requested failback to primary");
    let outcome = state.failover.failback().await?;
    Ok(Json(respond(
        &state,
        outcome,
        "switched back to primary",
        "already on primary",
    )))
}

fn respond(
    state: &CastorState,
    outcome: SwitchOutcome,
    switched: &str,
    unchanged: &str,
) -> FailoverResponse {
    let current_db = state.failover.current_role();
    match outcome {
        SwitchOutcome::Switched { prepare } => FailoverResponse {
            switched: true,
            current_db,
            message: switched.to_string(),
            prepare,
        },
        SwitchOutcome::Unchanged => FailoverResponse {
            switched: false,
            current_db,
            message: unchanged.to_string(),
            prepare: None,
        },
    }
}
