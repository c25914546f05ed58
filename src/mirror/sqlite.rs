//! Attached-file mirroring for SQLite.
//!
//! The mirror file is ATTACHed under the mirror alias. Trigger bodies cannot write to a table
//! of another attached database, so each mirrored table gets three triggers that append the
//! affected key (`OLD` and/or `NEW`) to `main._mirror_journal` inside the writing transaction.
//! Key values land in untyped columns `k0, k1, ...` with their storage class intact.
//! [`apply_journal`] then replays journaled keys onto the mirror: rows matching a key are
//! deleted from the mirror and the current row for that key, if any, is copied from `main`.
//!
//! Mirror tables are created from the source `CREATE TABLE` text, so a promoted mirror keeps
//! rowid aliases, `AUTOINCREMENT`, defaults and constraints. Foreign keys are not enforced
//! while mirror rows are written.

use crate::db::ident::{Ident, column_list, qualified, validate_type_name};
use crate::db::introspect::{self, MirrorTableSpec};
use crate::db::AttachSpec;
use crate::error::CastorError;
use castor_schema::{MirrorSetupResponse, TableError};
use sqlx::{Connection, SqliteConnection};
use std::collections::HashSet;
use tracing::{debug, info, warn};

pub const JOURNAL_TABLE: &str = "_mirror_journal";
pub const TRIGGER_PREFIX: &str = "trg_mirror_";
const TRIGGER_SUFFIXES: [&str; 3] = ["_ai", "_au", "_ad"];

fn main_schema() -> Ident {
    Ident::from_static("main")
}

fn journal() -> String {
    format!("\"main\".\"{JOURNAL_TABLE}\"")
}

/// Journal column holding the `i`-th key column.
fn key_column(i: usize) -> String {
    format!("\"k{i}\"")
}

pub async fn is_attached(conn: &mut SqliteConnection, schema: &Ident) -> Result<bool, sqlx::Error> {
    let names = sqlx::query_scalar::<_, String>("SELECT name FROM pragma_database_list")
        .fetch_all(&mut *conn)
        .await?;
    Ok(names.iter().any(|n| n == schema.as_str()))
}

/// ATTACHes the mirror file unless the alias is already present. Creates the file if missing.
pub async fn attach_if_needed(
    conn: &mut SqliteConnection,
    spec: &AttachSpec,
) -> Result<(), sqlx::Error> {
    if is_attached(conn, &spec.schema).await? {
        return Ok(());
    }
    let sql = format!("ATTACH DATABASE ?1 AS {}", spec.schema.quoted());
    sqlx::query(&sql)
        .bind(spec.path.to_string_lossy().into_owned())
        .execute(&mut *conn)
        .await?;
    debug!(alias = %spec.schema, path = %spec.path.display(), "attached mirror database");
    Ok(())
}

/// Sets `PRAGMA foreign_keys` and returns the previous setting. No effect inside a transaction.
async fn set_foreign_keys(conn: &mut SqliteConnection, on: bool) -> Result<bool, CastorError> {
    let previous = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys")
        .fetch_one(&mut *conn)
        .await?;
    let sql = if on {
        "PRAGMA foreign_keys = ON"
    } else {
        "PRAGMA foreign_keys = OFF"
    };
    sqlx::query(sql).execute(&mut *conn).await?;
    Ok(previous != 0)
}

async fn mirror_trigger_names(conn: &mut SqliteConnection) -> Result<Vec<String>, CastorError> {
    let names = sqlx::query_scalar::<_, String>(
        r"SELECT name FROM main.sqlite_master
          WHERE type = 'trigger' AND name LIKE 'trg\_mirror\_%' ESCAPE '\'",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(names)
}

async fn drop_trigger(conn: &mut SqliteConnection, name: &Ident) -> Result<(), CastorError> {
    sqlx::query(&format!("DROP TRIGGER IF EXISTS \"main\".{}", name.quoted()))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Creates the journal with at least `width` key columns, widening an existing one.
///
/// A journal from the single `key` column layout is replaced; its triggers are dropped first
/// and pending entries are discarded.
pub async fn ensure_journal(conn: &mut SqliteConnection, width: usize) -> Result<(), CastorError> {
    let width = width.max(1);
    let mut present = sqlx::query_scalar::<_, String>(
        "SELECT name FROM pragma_table_info(?1, 'main')",
    )
    .bind(JOURNAL_TABLE)
    .fetch_all(&mut *conn)
    .await?;

    if present.iter().any(|c| c == "key") {
        warn!("replacing mirror journal with the typed-key layout; run setup with copy_data to resync");
        for name in mirror_trigger_names(conn).await? {
            drop_trigger(conn, &Ident::parse(&name, "trigger")?).await?;
        }
        sqlx::query(&format!("DROP TABLE {}", journal()))
            .execute(&mut *conn)
            .await?;
        present.clear();
    }

    if present.is_empty() {
        let keys = (0..width).map(key_column).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (seq INTEGER PRIMARY KEY, tbl TEXT NOT NULL, {keys})",
            journal()
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        return Ok(());
    }

    for i in 0..width {
        if present.iter().any(|c| *c == format!("k{i}")) {
            continue;
        }
        sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {}", journal(), key_column(i)))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn trigger_name(table: &Ident, suffix: &str) -> Result<Ident, CastorError> {
    Ident::derived(TRIGGER_PREFIX, table, suffix, "trigger")
}

fn journal_insert(spec: &MirrorTableSpec, row: &str) -> String {
    let keys = (0..spec.primary_key.len())
        .map(key_column)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO \"{JOURNAL_TABLE}\" (tbl, {keys}) VALUES ({}, {});",
        spec.table.literal(),
        column_list(&spec.primary_key, row)
    )
}

/// `CREATE TRIGGER` statements for insert, update and delete, in that order.
pub fn trigger_statements(spec: &MirrorTableSpec) -> Result<Vec<String>, CastorError> {
    let new_key = journal_insert(spec, "NEW.");
    let old_key = journal_insert(spec, "OLD.");
    let table = spec.table.quoted();

    let ai = trigger_name(&spec.table, "_ai")?;
    let au = trigger_name(&spec.table, "_au")?;
    let ad = trigger_name(&spec.table, "_ad")?;

    Ok(vec![
        format!(
            "CREATE TRIGGER \"main\".{name} AFTER INSERT ON {table}\nBEGIN\n  {new_key}\nEND",
            name = ai.quoted(),
        ),
        format!(
            "CREATE TRIGGER \"main\".{name} AFTER UPDATE ON {table}\nBEGIN\n  {old_key}\n  {new_key}\nEND",
            name = au.quoted(),
        ),
        format!(
            "CREATE TRIGGER \"main\".{name} AFTER DELETE ON {table}\nBEGIN\n  {old_key}\nEND",
            name = ad.quoted(),
        ),
    ])
}

/// `alias."pk_i" IS j."k_i"` for every key column.
fn key_match(spec: &MirrorTableSpec, alias: &str) -> String {
    spec.primary_key
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{alias}.{} IS j.{}", c.quoted(), key_column(i)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Delete and copy statements replaying journaled keys of one table.
/// Both bind `?1` = table name and `?2` = highest journal sequence to apply.
pub fn apply_statements(
    schema: &Ident,
    spec: &MirrorTableSpec,
    columns: &[Ident],
) -> (String, String) {
    let pending = "j.tbl = ?1 AND j.seq <= ?2";
    let mirror = qualified(schema, &spec.table);
    let source = qualified(&main_schema(), &spec.table);

    let delete = format!(
        "DELETE FROM {mirror} WHERE ({pk}) IN (SELECT {m_pk} FROM {journal} AS j \
         JOIN {mirror} AS m ON {on} WHERE {pending})",
        pk = column_list(&spec.primary_key, ""),
        m_pk = column_list(&spec.primary_key, "m."),
        journal = journal(),
        on = key_match(spec, "m"),
    );
    let insert = format!(
        "INSERT INTO {mirror} ({cols}) SELECT DISTINCT {s_cols} FROM {journal} AS j \
         JOIN {source} AS s ON {on} WHERE {pending}",
        cols = column_list(columns, ""),
        s_cols = column_list(columns, "s."),
        journal = journal(),
        on = key_match(spec, "s"),
    );
    (delete, insert)
}

/// Replays pending journal entries onto the attached mirror in one transaction.
///
/// Returns the number of journal entries consumed. A connection without the journal table or
/// without the mirror attached is left untouched.
pub async fn apply_journal(
    conn: &mut SqliteConnection,
    schema: &Ident,
) -> Result<u64, CastorError> {
    let main = main_schema();
    if !introspect::sqlite_table_exists(conn, &main, JOURNAL_TABLE).await?
        || !is_attached(conn, schema).await?
    {
        return Ok(0);
    }
    let pending = sqlx::query_scalar::<_, i64>(&format!(
        "SELECT EXISTS (SELECT 1 FROM {})",
        journal()
    ))
    .fetch_one(&mut *conn)
    .await?;
    if pending == 0 {
        return Ok(0);
    }

    let enforced = set_foreign_keys(conn, false).await?;
    let drained = drain_journal(conn, schema).await;
    if enforced {
        set_foreign_keys(conn, true).await?;
    }
    drained
}

async fn drain_journal(conn: &mut SqliteConnection, schema: &Ident) -> Result<u64, CastorError> {
    let main = main_schema();
    let mut tx = conn.begin().await?;
    // Write lock first, so concurrent drains queue on the busy timeout instead of failing.
    sqlx::query(&format!("DELETE FROM {} WHERE 0", journal()))
        .execute(&mut *tx)
        .await?;
    let max_seq = sqlx::query_scalar::<_, Option<i64>>(&format!(
        "SELECT MAX(seq) FROM {}",
        journal()
    ))
    .fetch_one(&mut *tx)
    .await?;
    let Some(max_seq) = max_seq else {
        return Ok(0);
    };

    let tables = sqlx::query_scalar::<_, String>(&format!(
        "SELECT DISTINCT tbl FROM {} WHERE seq <= ?1",
        journal()
    ))
    .bind(max_seq)
    .fetch_all(&mut *tx)
    .await?;

    for table in tables {
        let info = introspect::sqlite_table(&mut tx, &main, &table).await?;
        let Ok(spec) = MirrorTableSpec::from_info(&info) else {
            continue;
        };
        if spec.primary_key.is_empty()
            || !introspect::sqlite_table_exists(&mut tx, schema, &table).await?
        {
            continue;
        }

        let mirror_columns: HashSet<String> = introspect::sqlite_table(&mut tx, schema, &table)
            .await?
            .columns
            .into_iter()
            .filter(|c| !c.generated)
            .map(|c| c.name)
            .collect();
        if !spec
            .primary_key
            .iter()
            .all(|c| mirror_columns.contains(c.as_str()))
        {
            warn!(table = %table, "mirror table lacks key columns; run mirror setup again");
            continue;
        }
        let columns: Vec<Ident> = spec
            .columns
            .iter()
            .filter(|c| mirror_columns.contains(c.as_str()))
            .cloned()
            .collect();

        let (delete, insert) = apply_statements(schema, &spec, &columns);
        sqlx::query(&delete)
            .bind(&table)
            .bind(max_seq)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&insert)
            .bind(&table)
            .bind(max_seq)
            .execute(&mut *tx)
            .await?;
    }

    let consumed = sqlx::query(&format!("DELETE FROM {} WHERE seq <= ?1", journal()))
        .bind(max_seq)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    Ok(consumed)
}

/// Declared SQLite type usable in `ALTER TABLE ... ADD COLUMN`, or none.
fn column_type(declared: &str) -> &str {
    let declared = declared.trim();
    if declared.is_empty() {
        return "";
    }
    validate_type_name(declared).unwrap_or("")
}

/// Column definitions and table options of a `CREATE TABLE` statement, from the opening
/// parenthesis on. Virtual tables have none.
pub fn table_body(ddl: &str) -> Option<&str> {
    let head = ddl.trim_start();
    if head
        .get(..14)
        .is_some_and(|h| h.eq_ignore_ascii_case("CREATE VIRTUAL"))
    {
        return None;
    }
    head.find('(').map(|i| &head[i..])
}

async fn create_mirror_table(
    conn: &mut SqliteConnection,
    schema: &Ident,
    spec: &MirrorTableSpec,
) -> Result<(), CastorError> {
    let main = main_schema();
    let mirror = qualified(schema, &spec.table);
    let ddl = introspect::sqlite_table_sql(conn, &main, spec.table.as_str()).await?;
    let sql = match ddl.as_deref().and_then(table_body) {
        Some(body) => format!("CREATE TABLE {mirror} {body}"),
        None => format!(
            "CREATE TABLE {mirror} AS SELECT * FROM {} WHERE 0",
            qualified(&main, &spec.table)
        ),
    };
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

struct TableOutcome {
    created: bool,
    triggers: u32,
}

async fn provision_table(
    conn: &mut SqliteConnection,
    schema: &Ident,
    spec: &MirrorTableSpec,
    copy_data: bool,
) -> Result<TableOutcome, CastorError> {
    let main = main_schema();
    let mirror = qualified(schema, &spec.table);
    let source = qualified(&main, &spec.table);

    let exists = introspect::sqlite_table_exists(conn, schema, spec.table.as_str()).await?;
    let mut created = !exists;
    let mut copy_data = copy_data;
    if exists {
        let current = introspect::sqlite_table(conn, schema, spec.table.as_str()).await?;
        let same_key = current
            .primary_key
            .iter()
            .map(String::as_str)
            .eq(spec.primary_key.iter().map(Ident::as_str));
        if same_key {
            let present: HashSet<String> = current.columns.into_iter().map(|c| c.name).collect();
            for (column, declared) in spec.columns.iter().zip(&spec.column_types) {
                if present.contains(column.as_str()) {
                    continue;
                }
                let sql = format!(
                    "ALTER TABLE {mirror} ADD COLUMN {} {}",
                    column.quoted(),
                    column_type(declared)
                );
                sqlx::query(sql.trim_end()).execute(&mut *conn).await?;
                info!(table = %spec.table, column = %column, "added missing mirror column");
            }
        } else {
            // Built without the source key; rebuild and refill it from the source.
            sqlx::query(&format!("DROP TABLE {mirror}"))
                .execute(&mut *conn)
                .await?;
            create_mirror_table(conn, schema, spec).await?;
            created = true;
            copy_data = true;
            info!(table = %spec.table, "rebuilt mirror table with the source key");
        }
    } else {
        create_mirror_table(conn, schema, spec).await?;
    }

    if copy_data {
        let cols = column_list(&spec.columns, "");
        sqlx::query(&format!("DELETE FROM {mirror}"))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!(
            "INSERT INTO {mirror} ({cols}) SELECT {cols} FROM {source}"
        ))
        .execute(&mut *conn)
        .await?;
        // The copy already reflects every journaled change of this table.
        sqlx::query(&format!("DELETE FROM {} WHERE tbl = ?1", journal()))
            .bind(spec.table.as_str())
            .execute(&mut *conn)
            .await?;
    }

    for suffix in TRIGGER_SUFFIXES {
        drop_trigger(conn, &trigger_name(&spec.table, suffix)?).await?;
    }

    if spec.primary_key.is_empty() {
        return Ok(TableOutcome {
            created,
            triggers: 0,
        });
    }

    let statements = trigger_statements(spec)?;
    let triggers = u32::try_from(statements.len()).unwrap_or(u32::MAX);
    for stmt in statements {
        sqlx::query(&stmt).execute(&mut *conn).await?;
    }
    Ok(TableOutcome { created, triggers })
}

/// Builds or repairs the attached mirror. Safe to rerun.
///
/// Failing to attach the file or to create the journal aborts the run. Per-table failures
/// are rolled back individually and reported in `errors`.
pub async fn setup(
    conn: &mut SqliteConnection,
    attach: &AttachSpec,
    excluded: &[String],
    copy_data: bool,
) -> Result<MirrorSetupResponse, CastorError> {
    attach_if_needed(conn, attach).await.map_err(|e| {
        CastorError::Provisioning(format!(
            "cannot attach mirror file {}: {e}",
            attach.path.display()
        ))
    })?;

    let enforced = set_foreign_keys(conn, false).await?;
    let result = provision_all(conn, attach, excluded, copy_data).await;
    if enforced {
        set_foreign_keys(conn, true).await?;
    }
    result
}

async fn provision_all(
    conn: &mut SqliteConnection,
    attach: &AttachSpec,
    excluded: &[String],
    copy_data: bool,
) -> Result<MirrorSetupResponse, CastorError> {
    let main = main_schema();
    let schema = &attach.schema;
    let tables = introspect::sqlite_tables(conn, &main).await?;

    let mut result = MirrorSetupResponse {
        mirror_schema: schema.to_string(),
        mirror_path: Some(attach.path.display().to_string()),
        tables_created: Vec::new(),
        triggers_created: 0,
        skipped_tables: Vec::new(),
        errors: Vec::new(),
    };

    let mut specs = Vec::new();
    for table in tables {
        if table == JOURNAL_TABLE || excluded.contains(&table) {
            continue;
        }
        let info = introspect::sqlite_table(conn, &main, &table).await?;
        match MirrorTableSpec::from_info(&info) {
            Ok(spec) => specs.push(spec),
            Err(e) => {
                warn!(table = %table, error = %e, "skipping table with unsafe identifiers");
                result.skipped_tables.push(table);
            }
        }
    }

    let width = specs.iter().map(|s| s.primary_key.len()).max().unwrap_or(1);
    ensure_journal(conn, width)
        .await
        .map_err(|e| CastorError::Provisioning(format!("cannot create mirror journal: {e}")))?;

    for spec in specs {
        let table = spec.table.to_string();
        let mut tx = conn.begin().await?;
        match provision_table(&mut tx, schema, &spec, copy_data).await {
            Ok(outcome) => {
                tx.commit().await?;
                if outcome.created {
                    result.tables_created.push(table.clone());
                }
                if outcome.triggers == 0 {
                    result.skipped_tables.push(table);
                } else {
                    result.triggers_created += outcome.triggers;
                }
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(table = %table, error = %rollback, "rollback after failed table setup failed");
                }
                warn!(table = %table, error = %e, "mirror setup failed for table");
                result.errors.push(TableError {
                    table: table.clone(),
                    message: e.to_string(),
                });
                result.skipped_tables.push(table);
            }
        }
    }

    info!(
        created = result.tables_created.len(),
        triggers = result.triggers_created,
        skipped = result.skipped_tables.len(),
        errors = result.errors.len(),
        "sqlite mirror setup finished"
    );
    Ok(result)
}

/// Mirror triggers installed on `main`.
pub async fn trigger_count(conn: &mut SqliteConnection) -> Result<i64, CastorError> {
    let count = mirror_trigger_names(conn).await?.len();
    Ok(i64::try_from(count).unwrap_or(i64::MAX))
}
