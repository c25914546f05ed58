use super::target::ConnectionTarget;
use crate::error::CastorError;
use castor_schema::Dialect;
use sqlx::postgres::PgConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::{str::FromStr, time::Duration};
use tracing::debug;

/// Outcome of one liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Healthy,
    Unhealthy(String),
}

impl ProbeStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeStatus::Healthy)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ProbeStatus::Healthy => None,
            ProbeStatus::Unhealthy(reason) => Some(reason),
        }
    }
}

/// Opens a fresh connection, runs a trivial query and closes it, all within `timeout`.
///
/// SQLite files are never created by a probe.
pub async fn try_probe(target: &ConnectionTarget, timeout: Duration) -> Result<(), CastorError> {
    match tokio::time::timeout(timeout, connect_and_ping(target)).await {
        Ok(res) => res,
        Err(_) => Err(CastorError::ProbeTimeout(timeout)),
    }
}

/// Infallible variant of [`try_probe`].
pub async fn probe(target: &ConnectionTarget, timeout: Duration) -> ProbeStatus {
    match try_probe(target, timeout).await {
        Ok(()) => ProbeStatus::Healthy,
        Err(e) => {
            debug!(role = %target.role(), target = %target.redacted(), error = %e, "probe failed");
            ProbeStatus::Unhealthy(e.to_string())
        }
    }
}

async fn connect_and_ping(target: &ConnectionTarget) -> Result<(), CastorError> {
    match target.dialect() {
        Dialect::Sqlite => {
            let mut conn = SqliteConnectOptions::from_str(target.dsn())?
                .create_if_missing(false)
                .connect()
                .await?;
            // Touches the file header, so a non-database file fails here.
            sqlx::query("SELECT count(*) FROM sqlite_master")
                .execute(&mut conn)
                .await?;
            conn.close().await?;
        }
        Dialect::Postgres => {
            let mut conn = PgConnectOptions::from_str(target.dsn())?.connect().await?;
            sqlx::query("SELECT 1").execute(&mut conn).await?;
            conn.close().await?;
        }
    }
    Ok(())
}
