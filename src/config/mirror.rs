use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Mirror provisioning settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MirrorConfig {
    /// Mirror namespace: SQLite attach alias or Postgres schema name.
    /// TOML: `mirror.schema`. Default: `mirror`.
    #[serde(default = "default_schema")]
    pub schema: String,

    /// SQLite mirror file attached to every primary connection.
    /// TOML: `mirror.path`. Default: unset.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Run mirror setup at boot.
    /// TOML: `mirror.auto_setup`. Default: `false`.
    #[serde(default)]
    pub auto_setup: bool,

    /// Bulk-copy existing rows during boot-time setup.
    /// TOML: `mirror.copy_data_on_setup`. Default: `true`.
    #[serde(default = "default_true")]
    pub copy_data_on_setup: bool,

    /// Allow `POST /mirror/setup` in Postgres schema mode. The DDL takes exclusive locks on
    /// every public table and blocks concurrent traffic while it runs.
    /// TOML: `mirror.allow_schema_ddl`. Default: `false`.
    #[serde(default)]
    pub allow_schema_ddl: bool,

    /// Tables never mirrored (migration bookkeeping).
    /// TOML: `mirror.excluded_tables`.
    #[serde(default = "default_excluded_tables")]
    pub excluded_tables: Vec<String>,

    /// Logical-replication subscriptions dropped when the mirror is promoted.
    /// Empty means every subscription of the mirror's current database.
    /// TOML: `mirror.subscriptions`. Default: empty.
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            path: None,
            auto_setup: false,
            copy_data_on_setup: true,
            allow_schema_ddl: false,
            excluded_tables: default_excluded_tables(),
            subscriptions: Vec::new(),
        }
    }
}

fn default_schema() -> String {
    "mirror".to_string()
}

fn default_true() -> bool {
    true
}

fn default_excluded_tables() -> Vec<String> {
    vec!["alembic_version".to_string(), "_sqlx_migrations".to_string()]
}
