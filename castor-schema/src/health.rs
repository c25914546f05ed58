use crate::mirror::TableError;
use crate::role::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub database: Role,
    pub timestamp: DateTime<Utc>,
    pub failover_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Credential-free view of a DSN.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UrlInfo {
    pub driver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetInfo {
    pub role: Role,
    pub connection: UrlInfo,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `GET /health/database`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseStatusResponse {
    pub current_database: Role,
    pub primary_info: TargetInfo,
    pub mirror_info: Option<TargetInfo>,
    pub using_mirror: bool,
    pub persisted: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SequenceReset {
    pub table: String,
    pub column: String,
    /// Value the next insert will receive.
    pub next_value: i64,
}

/// What promoting the mirror had to clean up.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PrepareReport {
    pub subscriptions_dropped: Vec<String>,
    pub sequences: Vec<SequenceReset>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<TableError>,
}

/// Body of the operator failover/failback endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FailoverResponse {
    pub switched: bool,
    pub current_db: Role,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare: Option<PrepareReport>,
}
