use super::{mode, postgres, preview, sqlite};
use crate::config::MirrorConfig;
use crate::db::{AttachSpec, ConnectionTarget, DbPool, Ident};
use crate::error::CastorError;
use crate::failover::FailoverController;
use castor_schema::{
    Dialect, MirrorMode, MirrorSetupResponse, MirrorStatusResponse, Role, TablePreview,
};
use sqlx::{PgPool, SqlitePool};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const RESERVED_SCHEMAS: &[&str] = &["main", "temp", "public", "pg_catalog", "information_schema"];

/// Where mirror reads go for the current role and mode.
enum Reader {
    Sqlite {
        pool: SqlitePool,
        schema: Ident,
        keys: Ident,
        replay: bool,
    },
    Postgres {
        pool: PgPool,
        schema: Ident,
        keys: Ident,
    },
}

struct MirrorServiceInner {
    failover: FailoverController,
    mode: MirrorMode,
    schema: Ident,
    path: Option<PathBuf>,
    allow_schema_ddl: bool,
    copy_data_on_setup: bool,
    excluded_tables: Vec<String>,
    /// Read pool for an externally replicated mirror while the primary is active.
    external: Option<DbPool>,
}

/// Mirror provisioning and inspection on top of the failover controller.
#[derive(Clone)]
pub struct MirrorService {
    inner: Arc<MirrorServiceInner>,
}

impl MirrorService {
    /// Attach spec for a SQLite primary with a configured mirror file.
    pub fn attach_spec(
        primary: &ConnectionTarget,
        cfg: &MirrorConfig,
    ) -> Result<Option<AttachSpec>, CastorError> {
        if primary.dialect() != Dialect::Sqlite {
            return Ok(None);
        }
        let Some(path) = cfg.path.clone() else {
            return Ok(None);
        };
        Ok(Some(AttachSpec {
            schema: mirror_schema(&cfg.schema)?,
            path,
        }))
    }

    pub fn new(
        failover: FailoverController,
        cfg: &MirrorConfig,
        explicit_mirror_url: Option<&str>,
    ) -> Result<Self, CastorError> {
        let schema = mirror_schema(&cfg.schema)?;
        let mode = mode::detect(failover.primary(), explicit_mirror_url, cfg.path.as_deref());

        let external = match mode {
            MirrorMode::External => {
                let target = failover.mirror().ok_or_else(|| {
                    CastorError::Config("external mirror mode without a mirror target".into())
                })?;
                Some(DbPool::connect_lazy(
                    target,
                    None,
                    failover.settings().probe_timeout,
                )?)
            }
            _ => None,
        };
        if mode == MirrorMode::Attached && failover.attach_spec().is_none() {
            return Err(CastorError::Config(
                "attached mirror mode needs the controller to attach the mirror file".into(),
            ));
        }

        info!(mode = %mode, schema = %schema, "mirror service ready");
        Ok(Self {
            inner: Arc::new(MirrorServiceInner {
                failover,
                mode,
                schema,
                path: cfg.path.clone(),
                allow_schema_ddl: cfg.allow_schema_ddl,
                copy_data_on_setup: cfg.copy_data_on_setup,
                excluded_tables: cfg.excluded_tables.clone(),
                external,
            }),
        })
    }

    pub fn mode(&self) -> MirrorMode {
        self.inner.mode
    }

    /// Operator-triggered setup, subject to the mode's refusals.
    pub async fn setup(&self, copy_data: bool) -> Result<MirrorSetupResponse, CastorError> {
        match self.inner.mode {
            MirrorMode::External => Err(CastorError::ProvisioningRefused(
                "the mirror is a separate database kept in sync by replication".into(),
            )),
            MirrorMode::Unknown => Err(CastorError::ProvisioningRefused(
                "mirror.path is not configured for the sqlite primary".into(),
            )),
            MirrorMode::Schema if !self.inner.allow_schema_ddl => {
                Err(CastorError::ProvisioningRefused(
                    "schema mirror setup locks every public table; set mirror.allow_schema_ddl to enable it"
                        .into(),
                ))
            }
            MirrorMode::Attached | MirrorMode::Schema => self.run_setup(copy_data).await,
        }
    }

    /// Boot-time setup. A schema mirror is only built when missing.
    pub async fn auto_setup(&self) -> Result<Option<MirrorSetupResponse>, CastorError> {
        match self.inner.mode {
            MirrorMode::Attached => self
                .run_setup(self.inner.copy_data_on_setup)
                .await
                .map(Some),
            MirrorMode::Schema => {
                let active = self.inner.failover.current();
                let pool = postgres_pool(active.pool())?;
                if postgres::needs_setup(pool, &self.inner.schema).await? {
                    self.run_setup(self.inner.copy_data_on_setup).await.map(Some)
                } else {
                    info!(schema = %self.inner.schema, "schema mirror already in place");
                    Ok(None)
                }
            }
            MirrorMode::External | MirrorMode::Unknown => {
                info!(mode = %self.inner.mode, "mirror auto-setup skipped");
                Ok(None)
            }
        }
    }

    async fn run_setup(&self, copy_data: bool) -> Result<MirrorSetupResponse, CastorError> {
        let active = self.inner.failover.current();
        if active.role() == Role::Mirror {
            return Err(CastorError::MirrorActive);
        }
        // Owned copies: the handler future must stay Send across the awaits below.
        let excluded = self.inner.excluded_tables.clone();
        let schema = self.inner.schema.clone();

        let report = match self.inner.mode {
            MirrorMode::Attached => {
                let attach = self.inner.failover.attach_spec().cloned().ok_or_else(|| {
                    CastorError::ProvisioningRefused("no mirror file attached".into())
                })?;
                let pool = sqlite_pool(active.pool())?.clone();
                let mut conn = pool.acquire().await?;
                sqlite::setup(&mut conn, &attach, &excluded, copy_data).await?
            }
            MirrorMode::Schema => {
                let pool = postgres_pool(active.pool())?.clone();
                postgres::setup(&pool, &schema, &excluded, copy_data).await?
            }
            MirrorMode::External | MirrorMode::Unknown => {
                return Err(CastorError::ProvisioningRefused(format!(
                    "no setup for {} mirrors",
                    self.inner.mode
                )));
            }
        };

        info!(
            mode = %self.inner.mode,
            tables_created = report.tables_created.len(),
            triggers_created = report.triggers_created,
            skipped = report.skipped_tables.len(),
            errors = report.errors.len(),
            "mirror setup finished"
        );
        Ok(report)
    }

    pub async fn status(&self) -> Result<MirrorStatusResponse, CastorError> {
        let failover = &self.inner.failover;
        let active = failover.current();

        let (attached, triggers) = match (self.inner.mode, active.role()) {
            (MirrorMode::Attached, Role::Primary) => {
                let mut conn = sqlite_pool(active.pool())?.acquire().await?;
                let attached = sqlite::is_attached(&mut conn, &self.inner.schema).await?;
                (Some(attached), sqlite::trigger_count(&mut conn).await?)
            }
            (MirrorMode::Attached, Role::Mirror) => (Some(false), 0),
            (MirrorMode::Schema, _) => {
                let mut conn = postgres_pool(active.pool())?.acquire().await?;
                (None, postgres::trigger_count(&mut conn).await?)
            }
            _ => (None, 0),
        };
        let tables = match self.inner.mode {
            MirrorMode::Unknown => Vec::new(),
            _ => self.tables().await?,
        };

        Ok(MirrorStatusResponse {
            dialect: failover.primary().dialect(),
            mirror_mode: self.inner.mode,
            mirror_schema: self.inner.schema.to_string(),
            mirror_path: self.inner.path.as_ref().map(|p| p.display().to_string()),
            attached,
            mirror_tables_count: tables.len(),
            tables,
            mirror_triggers_count: triggers,
            current_active_db: active.role(),
            primary_connection: failover.primary().url_info(),
            mirror_connection: failover.mirror().map(ConnectionTarget::url_info),
        })
    }

    pub async fn tables(&self) -> Result<Vec<String>, CastorError> {
        match self.reader()? {
            Reader::Sqlite {
                pool,
                schema,
                replay,
                ..
            } => {
                let mut conn = pool.acquire().await?;
                if replay {
                    replay_journal(&mut conn, &schema).await;
                }
                preview::sqlite_tables(&mut conn, &schema).await
            }
            Reader::Postgres { pool, schema, .. } => {
                let mut conn = pool.acquire().await?;
                preview::pg_tables(&mut conn, schema.as_str()).await
            }
        }
    }

    pub async fn preview(&self, table: &str, limit: i64) -> Result<TablePreview, CastorError> {
        match self.reader()? {
            Reader::Sqlite {
                pool,
                schema,
                keys,
                replay,
            } => {
                let mut conn = pool.acquire().await?;
                if replay {
                    replay_journal(&mut conn, &schema).await;
                }
                preview::sqlite_preview(&mut conn, &schema, &keys, table, limit).await
            }
            Reader::Postgres { pool, schema, keys } => {
                let mut conn = pool.acquire().await?;
                preview::pg_preview(&mut conn, &schema, &keys, table, limit).await
            }
        }
    }

    fn reader(&self) -> Result<Reader, CastorError> {
        let active = self.inner.failover.current();

        // On the mirror its own tables are the mirror copy.
        if active.role() == Role::Mirror {
            return Ok(own_tables(active.pool()));
        }

        match self.inner.mode {
            MirrorMode::Attached => Ok(Reader::Sqlite {
                pool: sqlite_pool(active.pool())?.clone(),
                schema: self.inner.schema.clone(),
                keys: Ident::from_static("main"),
                replay: true,
            }),
            MirrorMode::Schema => Ok(Reader::Postgres {
                pool: postgres_pool(active.pool())?.clone(),
                schema: self.inner.schema.clone(),
                keys: Ident::from_static(postgres::SOURCE_SCHEMA),
            }),
            MirrorMode::External => {
                let external = self.inner.external.as_ref().ok_or_else(|| {
                    CastorError::Config("external mirror pool missing".into())
                })?;
                Ok(own_tables(external))
            }
            MirrorMode::Unknown => Err(CastorError::ProvisioningRefused(
                "no mirror configured for this database".into(),
            )),
        }
    }
}

fn own_tables(pool: &DbPool) -> Reader {
    match pool {
        DbPool::Sqlite(pool) => Reader::Sqlite {
            pool: pool.clone(),
            schema: Ident::from_static("main"),
            keys: Ident::from_static("main"),
            replay: false,
        },
        DbPool::Postgres(pool) => Reader::Postgres {
            pool: pool.clone(),
            schema: Ident::from_static(postgres::SOURCE_SCHEMA),
            keys: Ident::from_static(postgres::SOURCE_SCHEMA),
        },
    }
}

async fn replay_journal(conn: &mut sqlx::SqliteConnection, schema: &Ident) {
    match sqlite::apply_journal(conn, schema).await {
        Ok(0) => {}
        Ok(applied) => debug!(applied, "mirror journal replayed before read"),
        Err(e) => warn!(error = %e, "mirror journal replay failed; reads may lag"),
    }
}

fn mirror_schema(name: &str) -> Result<Ident, CastorError> {
    let schema = Ident::parse(name, "schema")?;
    if RESERVED_SCHEMAS.contains(&schema.as_str()) {
        return Err(CastorError::Config(format!(
            "mirror.schema cannot be the reserved schema {schema}"
        )));
    }
    Ok(schema)
}

fn sqlite_pool(pool: &DbPool) -> Result<&SqlitePool, CastorError> {
    pool.as_sqlite()
        .ok_or_else(|| CastorError::UnsupportedDialect(pool.dialect().to_string()))
}

fn postgres_pool(pool: &DbPool) -> Result<&PgPool, CastorError> {
    pool.as_postgres()
        .ok_or_else(|| CastorError::UnsupportedDialect(pool.dialect().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_schemas_are_refused() {
        assert!(mirror_schema("mirror").is_ok());
        for name in ["main", "public", "temp"] {
            assert!(matches!(mirror_schema(name), Err(CastorError::Config(_))));
        }
        assert!(matches!(
            mirror_schema("mirror; drop"),
            Err(CastorError::IdentifierRejected { .. })
        ));
    }

    #[test]
    fn attach_spec_only_for_sqlite_with_path() {
        let cfg = MirrorConfig {
            path: Some(PathBuf::from("/tmp/castor_mirror.db")),
            ..MirrorConfig::default()
        };
        let lite = ConnectionTarget::new(Role::Primary, "sqlite:///tmp/castor.db").unwrap();
        let spec = MirrorService::attach_spec(&lite, &cfg).unwrap().unwrap();
        assert_eq!(spec.schema.as_str(), "mirror");

        let pg = ConnectionTarget::new(Role::Primary, "postgres://app@db/hr").unwrap();
        assert!(MirrorService::attach_spec(&pg, &cfg).unwrap().is_none());
        assert!(
            MirrorService::attach_spec(&lite, &MirrorConfig::default())
                .unwrap()
                .is_none()
        );
    }
}
