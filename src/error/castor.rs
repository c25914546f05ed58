use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::error;

use super::IsRetryable;

#[derive(Debug, ThisError)]
pub enum CastorError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("Database unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("Invalid {what} identifier: {name:?}")]
    IdentifierRejected { what: &'static str, name: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    #[error("Mirror setup refused: {0}")]
    ProvisioningRefused(String),

    #[error("Mirror setup failed: {0}")]
    Provisioning(String),

    #[error("Unsupported database dialect: {0}")]
    UnsupportedDialect(String),

    #[error("Both primary ({primary}) and mirror ({mirror}) are unreachable")]
    DualOutage { primary: String, mirror: String },

    #[error("Failover is disabled: no mirror database configured")]
    FailoverDisabled,

    #[error("The mirror is currently serving traffic")]
    MirrorActive,

    #[error("Mirror table not found: {0}")]
    TableNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Ractor error: {0}")]
    RactorError(String),
}

impl CastorError {
    pub(crate) fn rejected(what: &'static str, name: impl Into<String>) -> Self {
        CastorError::IdentifierRejected {
            what,
            name: name.into(),
        }
    }
}

impl IntoResponse for CastorError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_body) = match self {
            CastorError::DatabaseError(_)
            | CastorError::UnsupportedDialect(_)
            | CastorError::Config(_)
            | CastorError::IoError(_)
            | CastorError::JsonError(_)
            | CastorError::RactorError(_) => {
                error!(error = %self, "request failed with an internal error");
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                let body = ApiErrorObject {
                    code: "INTERNAL_ERROR".to_string(),
                    message: "An internal server error occurred.".to_string(),
                    details: None,
                };
                (status, body)
            }

            CastorError::Provisioning(reason) => {
                error!(reason = %reason, "mirror provisioning aborted");
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                let body = ApiErrorObject {
                    code: "PROVISIONING_FAILED".to_string(),
                    message: "Mirror setup failed.".to_string(),
                    details: Some(Value::String(reason)),
                };
                (status, body)
            }

            CastorError::ProbeTimeout(_) => {
                let status = StatusCode::SERVICE_UNAVAILABLE;
                let body = ApiErrorObject {
                    code: "DATABASE_UNAVAILABLE".to_string(),
                    message: "The active database did not answer in time.".to_string(),
                    details: None,
                };
                (status, body)
            }

            CastorError::DatabaseUnavailable(reason) => {
                let status = StatusCode::SERVICE_UNAVAILABLE;
                let body = ApiErrorObject {
                    code: "DATABASE_UNAVAILABLE".to_string(),
                    message: reason,
                    details: None,
                };
                (status, body)
            }

            CastorError::DualOutage { .. } => {
                let status = StatusCode::SERVICE_UNAVAILABLE;
                let body = ApiErrorObject {
                    code: "DUAL_OUTAGE".to_string(),
                    message: "Primary and mirror databases are both unreachable.".to_string(),
                    details: None,
                };
                (status, body)
            }

            CastorError::IdentifierRejected { what, name } => {
                let status = StatusCode::BAD_REQUEST;
                let body = ApiErrorObject {
                    code: "INVALID_IDENTIFIER".to_string(),
                    message: format!("Invalid {what} identifier."),
                    details: Some(Value::String(name)),
                };
                (status, body)
            }

            CastorError::InvalidRequest(reason) => {
                let status = StatusCode::BAD_REQUEST;
                let body = ApiErrorObject {
                    code: "INVALID_REQUEST".to_string(),
                    message: reason,
                    details: None,
                };
                (status, body)
            }

            CastorError::InvalidLimit(reason) => {
                let status = StatusCode::BAD_REQUEST;
                let body = ApiErrorObject {
                    code: "INVALID_LIMIT".to_string(),
                    message: reason,
                    details: None,
                };
                (status, body)
            }

            CastorError::ProvisioningRefused(reason) => {
                let status = StatusCode::BAD_REQUEST;
                let body = ApiErrorObject {
                    code: "SETUP_REFUSED".to_string(),
                    message: reason,
                    details: None,
                };
                (status, body)
            }

            CastorError::FailoverDisabled => {
                let status = StatusCode::BAD_REQUEST;
                let body = ApiErrorObject {
                    code: "FAILOVER_DISABLED".to_string(),
                    message: "No mirror database configured.".to_string(),
                    details: None,
                };
                (status, body)
            }

            CastorError::MirrorActive => {
                let status = StatusCode::CONFLICT;
                let body = ApiErrorObject {
                    code: "MIRROR_ACTIVE".to_string(),
                    message: "The mirror is serving traffic; fail back before provisioning."
                        .to_string(),
                    details: None,
                };
                (status, body)
            }

            CastorError::TableNotFound(table) => {
                let status = StatusCode::NOT_FOUND;
                let body = ApiErrorObject {
                    code: "TABLE_NOT_FOUND".to_string(),
                    message: "Mirror table not found.".to_string(),
                    details: Some(Value::String(table)),
                };
                (status, body)
            }
        };
        (status, Json(ApiErrorBody { inner: error_body })).into_response()
    }
}

/// Standardized API error response payload.
#[derive(Serialize)]
pub struct ApiErrorObject {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Serialize)]
pub struct ApiErrorBody {
    #[serde(rename = "error")]
    pub inner: ApiErrorObject,
}

impl IsRetryable for CastorError {
    fn is_retryable(&self) -> bool {
        match self {
            CastorError::ProbeTimeout(_) | CastorError::DatabaseUnavailable(_) => true,
            CastorError::DatabaseError(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::Database(_)
            ),
            _ => false,
        }
    }
}
