use serde::{Deserialize, Serialize};

/// Connection strings for the primary and the optional mirror.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// DSN of the primary database (`sqlite://…` or `postgres://…`).
    /// TOML: `database.primary_url`. Default: `sqlite://data.db`.
    #[serde(default)]
    pub primary_url: String,

    /// DSN of the standby mirror. Absence disables failover.
    /// TOML: `database.mirror_url`. Default: unset.
    #[serde(default)]
    pub mirror_url: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            primary_url: "sqlite://data.db".to_string(),
            mirror_url: None,
        }
    }
}
