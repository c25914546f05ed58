mod basic;
mod database;
mod failover;
mod mirror;

pub use basic::BasicConfig;
pub use database::DatabaseConfig;
pub use failover::FailoverConfig;
pub use mirror::MirrorConfig;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use crate::db::{ConnectionTarget, redact_dsn};
use castor_schema::Role;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::LazyLock};

/// Application configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Core server configuration (see `basic` table in config.toml).
    #[serde(default)]
    pub basic: BasicConfig,

    /// Primary / mirror connection strings (see `database` table in config.toml).
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Mirror provisioning settings (see `mirror` table in config.toml).
    #[serde(default)]
    pub mirror: MirrorConfig,

    /// Failover policy (see `failover` table in config.toml).
    #[serde(default)]
    pub failover: FailoverConfig,
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "CASTOR_";

impl Config {
    /// Builds a Figment that merges defaults, an optional config TOML file and
    /// `CASTOR_`-prefixed environment variables (`__` separates nested keys).
    pub fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        let figment = if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment.merge(Toml::file(DEFAULT_CONFIG_FILE))
        } else {
            figment
        };
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Loads configuration and validates required fields.
    pub fn load() -> Self {
        let cfg: Self = Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration (defaults + config.toml + env): {err}")
        });
        if cfg.basic.admin_key.trim().is_empty() {
            panic!("basic.admin_key must be set and non-empty");
        }
        if cfg.database.primary_url.trim().is_empty() {
            panic!("database.primary_url must be set and non-empty");
        }
        if let Err(err) = cfg.validate_mirror_target() {
            panic!("{err}");
        }
        cfg
    }

    /// For SQLite primaries the failover target and the attached mirror file must be the
    /// same file; an explicit `database.mirror_url` may only restate `mirror.path`.
    pub fn validate_mirror_target(&self) -> Result<(), String> {
        if !self.database.primary_url.starts_with("sqlite:") {
            return Ok(());
        }
        let (Some(url), Some(path)) = (
            self.database
                .mirror_url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty()),
            self.mirror.path.as_deref(),
        ) else {
            return Ok(());
        };
        let target = ConnectionTarget::new(Role::Mirror, url)
            .map_err(|e| format!("database.mirror_url is invalid: {e}"))?;
        if target.sqlite_path().as_deref() == Some(path) {
            return Ok(());
        }
        Err(format!(
            "database.mirror_url ({}) and mirror.path ({}) name different mirrors; \
             set only mirror.path for a sqlite primary",
            redact_dsn(url),
            path.display()
        ))
    }

    /// Mirror DSN used as the failover target.
    ///
    /// An explicit `database.mirror_url` wins. For SQLite primaries without one, the attached
    /// mirror file doubles as the failover target.
    pub fn mirror_target_url(&self) -> Option<String> {
        if let Some(url) = self
            .database
            .mirror_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
        {
            return Some(url.to_string());
        }
        if self.database.primary_url.starts_with("sqlite:") {
            return self
                .mirror
                .path
                .as_ref()
                .map(|p| format!("sqlite://{}", p.display()));
        }
        None
    }
}

/// Global, lazily-initialized configuration instance.
pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::load);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_mirror_url_wins() {
        let mut cfg = Config::default();
        cfg.database.primary_url = "postgres://u:p@primary/app".to_string();
        cfg.database.mirror_url = Some("postgres://u:p@standby/app".to_string());
        assert_eq!(
            cfg.mirror_target_url().as_deref(),
            Some("postgres://u:p@standby/app")
        );
        assert!(cfg.validate_mirror_target().is_ok());
    }

    #[test]
    fn sqlite_mirror_url_must_name_the_attached_file() {
        let mut cfg = Config::default();
        cfg.database.primary_url = "sqlite://data.db".to_string();
        cfg.mirror.path = Some(PathBuf::from("mirror.db"));

        cfg.database.mirror_url = Some("sqlite://other.db".to_string());
        let err = cfg.validate_mirror_target().unwrap_err();
        assert!(err.contains("mirror.path"), "{err}");

        cfg.database.mirror_url = Some("sqlite://mirror.db".to_string());
        assert!(cfg.validate_mirror_target().is_ok());
        assert_eq!(cfg.mirror_target_url().as_deref(), Some("sqlite://mirror.db"));

        cfg.database.mirror_url = None;
        assert!(cfg.validate_mirror_target().is_ok());
    }

    #[test]
    fn sqlite_falls_back_to_mirror_path() {
        let mut cfg = Config::default();
        cfg.database.primary_url = "sqlite://data.db".to_string();
        cfg.mirror.path = Some(PathBuf::from("mirror.db"));
        assert_eq!(cfg.mirror_target_url().as_deref(), Some("sqlite://mirror.db"));
    }

    #[test]
    fn postgres_without_mirror_url_has_no_target() {
        let mut cfg = Config::default();
        cfg.database.primary_url = "postgres://u:p@localhost/app".to_string();
        cfg.mirror.path = Some(PathBuf::from("mirror.db"));
        assert!(cfg.mirror_target_url().is_none());
    }
}
