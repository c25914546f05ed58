use crate::error::CastorError;
use crate::server::router::CastorState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Answers 503 while the monitor reports the active database down.
///
/// Only reads the last-known state; the actual check (and any failover) runs in the monitor.
pub async fn require_database(
    State(state): State<CastorState>,
    req: Request,
    next: Next,
) -> Response {
    if state.failover.is_available() {
        return next.run(req).await;
    }

    if let Some(monitor) = &state.monitor
        && let Err(e) = monitor.check_now()
    {
        warn!(error = %e, "could not nudge the health monitor");
    }
    let role = state.failover.current_role();
    CastorError::DatabaseUnavailable(format!("{role} database is unreachable")).into_response()
}
