//! Makes a promoted mirror writable: inbound subscriptions are dropped and key sequences are
//! moved past the rows replicated into it.
//!
//! Every step is best effort. Failures are logged and collected in the report.

use crate::db::{DbPool, Ident, introspect};
use crate::error::CastorError;
use castor_schema::{PrepareReport, SequenceReset, TableError};
use sqlx::{PgPool, SqlitePool};
use tracing::{debug, info, warn};

pub async fn prepare_mirror(
    pool: &DbPool,
    subscriptions: &[String],
    excluded_tables: &[String],
) -> PrepareReport {
    let mut report = PrepareReport::default();
    match pool {
        DbPool::Postgres(pg) => {
            drop_subscriptions(pg, subscriptions, &mut report).await;
            resync_pg_sequences(pg, excluded_tables, &mut report).await;
        }
        DbPool::Sqlite(sqlite) => {
            resync_sqlite_sequences(sqlite, excluded_tables, &mut report).await;
        }
    }
    for reset in &report.sequences {
        debug!(
            table = %reset.table,
            column = %reset.column,
            next_value = reset.next_value,
            "sequence resynced"
        );
    }
    info!(
        subscriptions_dropped = report.subscriptions_dropped.len(),
        sequences = report.sequences.len(),
        errors = report.errors.len(),
        "mirror prepared for writes"
    );
    report
}

fn record(report: &mut PrepareReport, table: &str, error: &CastorError) {
    warn!(table, error = %error, "mirror preparation step failed");
    report.errors.push(TableError {
        table: table.to_string(),
        message: error.to_string(),
    });
}

// ---- Postgres ----

async fn drop_subscriptions(pool: &PgPool, configured: &[String], report: &mut PrepareReport) {
    let names = if configured.is_empty() {
        let listed = sqlx::query_scalar::<_, String>(
            "SELECT s.subname::text FROM pg_subscription s
             JOIN pg_database d ON d.oid = s.subdbid
             WHERE d.datname = current_database()
             ORDER BY s.subname",
        )
        .fetch_all(pool)
        .await;
        match listed {
            Ok(names) => names,
            Err(e) => {
                record(report, "pg_subscription", &CastorError::from(e));
                return;
            }
        }
    } else {
        configured.to_vec()
    };

    for name in names {
        match drop_subscription(pool, &name).await {
            Ok(true) => report.subscriptions_dropped.push(name),
            Ok(false) => {}
            Err(e) => record(report, &name, &e),
        }
    }
}

/// Returns `false` when the subscription does not exist.
async fn drop_subscription(pool: &PgPool, name: &str) -> Result<bool, CastorError> {
    let sub = Ident::parse(name, "subscription")?;
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM pg_subscription WHERE subname = $1)",
    )
    .bind(sub.as_str())
    .fetch_one(pool)
    .await?;
    if !exists {
        return Ok(false);
    }

    // Detaching the slot first lets DROP succeed while the publisher is unreachable.
    // DROP SUBSCRIPTION cannot run inside a transaction block.
    for stmt in [
        format!("ALTER SUBSCRIPTION {} DISABLE", sub.quoted()),
        format!("ALTER SUBSCRIPTION {} SET (slot_name = NONE)", sub.quoted()),
        format!("DROP SUBSCRIPTION IF EXISTS {}", sub.quoted()),
    ] {
        sqlx::raw_sql(&stmt).execute(pool).await?;
    }
    info!(subscription = %sub, "dropped inbound subscription");
    Ok(true)
}

async fn resync_pg_sequences(pool: &PgPool, excluded: &[String], report: &mut PrepareReport) {
    let tables = match pool.acquire().await {
        Ok(mut conn) => introspect::pg_tables(&mut conn, "public").await,
        Err(e) => Err(e.into()),
    };
    let tables = match tables {
        Ok(tables) => tables,
        Err(e) => {
            record(report, "public", &e);
            return;
        }
    };

    for table in &tables {
        if excluded.contains(table) {
            continue;
        }
        match resync_pg_table(pool, table).await {
            Ok(resets) => report.sequences.extend(resets),
            Err(e) => record(report, table, &e),
        }
    }
}

async fn resync_pg_table(pool: &PgPool, table: &str) -> Result<Vec<SequenceReset>, CastorError> {
    let table_ident = Ident::parse(table, "table")?;
    let info = {
        let mut conn = pool.acquire().await?;
        introspect::pg_table(&mut conn, "public", table).await?
    };

    let mut resets = Vec::new();
    for column in &info.primary_key {
        let column_ident = Ident::parse(column, "column")?;
        let sequence = sqlx::query_scalar::<_, Option<String>>(
            "SELECT pg_get_serial_sequence($1, $2)",
        )
        .bind(format!("public.{}", table_ident.quoted()))
        .bind(column_ident.as_str())
        .fetch_one(pool)
        .await?;
        let Some(sequence) = sequence else {
            continue;
        };

        let sql = format!(
            "SELECT setval($1::regclass, COALESCE((SELECT MAX({col}) FROM public.{tbl}), 0) + 1, false)",
            col = column_ident.quoted(),
            tbl = table_ident.quoted(),
        );
        let next_value = sqlx::query_scalar::<_, i64>(&sql)
            .bind(&sequence)
            .fetch_one(pool)
            .await?;
        resets.push(SequenceReset {
            table: table.to_string(),
            column: column.clone(),
            next_value,
        });
    }
    Ok(resets)
}

// ---- SQLite ----

async fn resync_sqlite_sequences(
    pool: &SqlitePool,
    excluded: &[String],
    report: &mut PrepareReport,
) {
    // Tables declared with AUTOINCREMENT; the others reuse MAX(rowid) + 1 on their own.
    let tables = match sqlx::query_scalar::<_, String>(
        r"SELECT name FROM sqlite_master
          WHERE type = 'table' AND name NOT LIKE 'sqlite\_%' ESCAPE '\'
            AND sql LIKE '%AUTOINCREMENT%'
          ORDER BY name",
    )
    .fetch_all(pool)
    .await
    {
        Ok(tables) => tables,
        Err(e) => {
            record(report, "sqlite_sequence", &CastorError::from(e));
            return;
        }
    };

    for table in &tables {
        if excluded.contains(table) {
            continue;
        }
        match resync_sqlite_table(pool, table).await {
            Ok(Some(reset)) => report.sequences.push(reset),
            Ok(None) => {}
            Err(e) => record(report, table, &e),
        }
    }
}

async fn resync_sqlite_table(
    pool: &SqlitePool,
    table: &str,
) -> Result<Option<SequenceReset>, CastorError> {
    let table_ident = Ident::parse(table, "table")?;
    let main = Ident::from_static("main");
    let info = {
        let mut conn = pool.acquire().await?;
        introspect::sqlite_table(&mut conn, &main, table).await?
    };
    // AUTOINCREMENT only applies to a single INTEGER PRIMARY KEY.
    let [column] = info.primary_key.as_slice() else {
        return Ok(None);
    };
    let column_ident = Ident::parse(column, "column")?;

    let sql = format!(
        "SELECT COALESCE(MAX({}), 0) FROM {}",
        column_ident.quoted(),
        table_ident.quoted()
    );
    let max = sqlx::query_scalar::<_, i64>(&sql).fetch_one(pool).await?;

    // A table that never received a row has no sqlite_sequence entry yet.
    let mut tx = pool.begin().await?;
    let updated = sqlx::query("UPDATE sqlite_sequence SET seq = ?1 WHERE name = ?2")
        .bind(max)
        .bind(table)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if updated == 0 {
        sqlx::query("INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)")
            .bind(table)
            .bind(max)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(Some(SequenceReset {
        table: table.to_string(),
        column: column.clone(),
        next_value: max + 1,
    }))
}
