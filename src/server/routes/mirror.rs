use crate::error::CastorError;
use crate::mirror::parse_limit;
use crate::server::router::CastorState;
use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    routing::{get, post},
};
use castor_schema::{
    MirrorSetupRequest, MirrorSetupResponse, MirrorStatusResponse, MirrorTablesResponse,
    TablePreview,
};
use serde::Deserialize;
use tracing::debug;

pub fn router() -> Router<CastorState> {
    Router::new()
        .route("/mirror/status", get(status_handler))
        .route("/mirror/setup", post(setup_handler))
        .route("/mirror/tables", get(tables_handler))
        .route("/mirror/table/{name}", get(preview_handler))
}

/// Raw so that a malformed limit maps to our own 400 body.
#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub limit: Option<String>,
}

/// GET /mirror/status
pub async fn status_handler(
    State(state): State<CastorState>,
) -> Result<Json<MirrorStatusResponse>, CastorError> {
    Ok(Json(state.mirror.status().await?))
}

/// POST /mirror/setup
///
/// An empty body means `{"copy_data": true}`.
pub async fn setup_handler(
    State(state): State<CastorState>,
    payload: Result<Json<MirrorSetupRequest>, JsonRejection>,
) -> Result<Json<MirrorSetupResponse>, CastorError> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => MirrorSetupRequest::default(),
        Err(e) => {
            debug!(error = %e, "rejecting mirror setup body");
            return Err(CastorError::InvalidRequest(e.body_text()));
        }
    };
    Ok(Json(state.mirror.setup(request.copy_data).await?))
}

/// GET /mirror/tables
pub async fn tables_handler(
    State(state): State<CastorState>,
) -> Result<Json<MirrorTablesResponse>, CastorError> {
    let tables = state.mirror.tables().await?;
    Ok(Json(MirrorTablesResponse { tables }))
}

/// GET /mirror/table/{name}?limit=N
pub async fn preview_handler(
    State(state): State<CastorState>,
    Path(name): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<TablePreview>, CastorError> {
    let limit = parse_limit(query.limit.as_deref())?;
    Ok(Json(state.mirror.preview(&name, limit).await?))
}
