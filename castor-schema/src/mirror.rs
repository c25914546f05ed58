use crate::health::UrlInfo;
use crate::role::{Dialect, MirrorMode, Role};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of `GET /mirror/status`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MirrorStatusResponse {
    pub dialect: Dialect,
    pub mirror_mode: MirrorMode,
    pub mirror_schema: String,
    pub mirror_path: Option<String>,
    /// `None` when attachment is not meaningful for the mode.
    pub attached: Option<bool>,
    pub tables: Vec<String>,
    pub mirror_tables_count: usize,
    pub mirror_triggers_count: i64,
    pub current_active_db: Role,
    pub primary_connection: UrlInfo,
    pub mirror_connection: Option<UrlInfo>,
}

fn default_copy_data() -> bool {
    true
}

/// Body of `POST /mirror/setup`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MirrorSetupRequest {
    #[serde(default = "default_copy_data")]
    pub copy_data: bool,
}

impl Default for MirrorSetupRequest {
    fn default() -> Self {
        Self { copy_data: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TableError {
    pub table: String,
    pub message: String,
}

/// Outcome of one provisioning pass.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MirrorSetupResponse {
    pub mirror_schema: String,
    pub mirror_path: Option<String>,
    pub tables_created: Vec<String>,
    pub triggers_created: u32,
    pub skipped_tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<TableError>,
}

/// Body of `GET /mirror/tables`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MirrorTablesResponse {
    pub tables: Vec<String>,
}

/// Body of `GET /mirror/table/{name}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TablePreview {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}
