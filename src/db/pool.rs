use super::ident::Ident;
use super::target::ConnectionTarget;
use crate::error::CastorError;
use crate::mirror::sqlite as sqlite_mirror;
use castor_schema::{Dialect, Role};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::{path::PathBuf, str::FromStr, time::Duration};
use tracing::{debug, warn};

/// SQLite mirror file attached to every connection of a primary pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachSpec {
    pub schema: Ident,
    pub path: PathBuf,
}

/// Pooled handle to whichever database is active.
#[derive(Debug, Clone)]
pub enum DbPool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl DbPool {
    /// Builds a pool without opening any connection.
    ///
    /// Primary SQLite files are created when missing; a mirror file must already exist.
    /// With `attach`, every new connection ATTACHes the mirror file and every released
    /// connection drains the mirror journal.
    pub fn connect_lazy(
        target: &ConnectionTarget,
        attach: Option<&AttachSpec>,
        acquire_timeout: Duration,
    ) -> Result<Self, CastorError> {
        match target.dialect() {
            Dialect::Sqlite => {
                let connect_opts = SqliteConnectOptions::from_str(target.dsn())
                    .map_err(|e| CastorError::Config(format!("invalid sqlite url: {e}")))?
                    .create_if_missing(target.role() == Role::Primary)
                    .busy_timeout(Duration::from_secs(5))
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal);

                let mut options = SqlitePoolOptions::new().acquire_timeout(acquire_timeout);

                if let Some(spec) = attach.cloned() {
                    let on_connect = spec.clone();
                    options = options
                        .after_connect(move |conn, _meta| {
                            let spec = on_connect.clone();
                            Box::pin(async move {
                                sqlite_mirror::attach_if_needed(conn, &spec).await?;
                                Ok(())
                            })
                        })
                        .after_release(move |conn, _meta| {
                            let schema = spec.schema.clone();
                            Box::pin(async move {
                                match sqlite_mirror::apply_journal(conn, &schema).await {
                                    Ok(0) => {}
                                    Ok(applied) => {
                                        debug!(applied, "mirror journal drained on release");
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "failed to drain mirror journal");
                                    }
                                }
                                Ok(true)
                            })
                        });
                }

                Ok(DbPool::Sqlite(options.connect_lazy_with(connect_opts)))
            }
            Dialect::Postgres => {
                let connect_opts = PgConnectOptions::from_str(target.dsn())
                    .map_err(|e| CastorError::Config(format!("invalid postgres url: {e}")))?;
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .acquire_timeout(acquire_timeout)
                    .connect_lazy_with(connect_opts);
                Ok(DbPool::Postgres(pool))
            }
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            DbPool::Sqlite(_) => Dialect::Sqlite,
            DbPool::Postgres(_) => Dialect::Postgres,
        }
    }

    pub fn as_sqlite(&self) -> Option<&SqlitePool> {
        match self {
            DbPool::Sqlite(pool) => Some(pool),
            DbPool::Postgres(_) => None,
        }
    }

    pub fn as_postgres(&self) -> Option<&PgPool> {
        match self {
            DbPool::Postgres(pool) => Some(pool),
            DbPool::Sqlite(_) => None,
        }
    }

    /// Closes every pooled connection; later acquires fail with `PoolClosed`.
    pub async fn close(&self) {
        match self {
            DbPool::Sqlite(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            DbPool::Sqlite(pool) => pool.is_closed(),
            DbPool::Postgres(pool) => pool.is_closed(),
        }
    }
}
