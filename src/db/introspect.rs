//! Live schema introspection for SQLite and Postgres.
//!
//! Names are returned raw; callers turn them into [`Ident`]s (and decide what to skip) through
//! [`MirrorTableSpec::from_info`].

use super::ident::Ident;
use crate::error::CastorError;
use sqlx::{PgConnection, SqliteConnection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type (SQLite) or `format_type()` output (Postgres).
    pub type_name: String,
    /// Generated column (stored or virtual); never written directly.
    pub generated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    /// Primary-key columns in key order.
    pub primary_key: Vec<String>,
}

/// Validated description of one table to mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTableSpec {
    pub table: Ident,
    /// Writable columns in table order.
    pub columns: Vec<Ident>,
    pub column_types: Vec<String>,
    pub primary_key: Vec<Ident>,
}

impl MirrorTableSpec {
    /// Rejects the table when its name or any column name fails the identifier guard.
    pub fn from_info(info: &TableInfo) -> Result<Self, CastorError> {
        let table = Ident::parse(&info.name, "table")?;
        let writable = info.columns.iter().filter(|c| !c.generated);
        let columns = writable
            .clone()
            .map(|c| Ident::parse(&c.name, "column"))
            .collect::<Result<Vec<_>, _>>()?;
        let column_types = writable.map(|c| c.type_name.clone()).collect();
        let primary_key = info
            .primary_key
            .iter()
            .map(|c| Ident::parse(c, "column"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            table,
            columns,
            column_types,
            primary_key,
        })
    }

    pub fn non_key_columns(&self) -> impl Iterator<Item = &Ident> {
        self.columns
            .iter()
            .filter(|c| !self.primary_key.contains(c))
    }
}

// ---- SQLite ----

/// User tables of an attached database (`main`, or the mirror alias).
pub async fn sqlite_tables(
    conn: &mut SqliteConnection,
    schema: &Ident,
) -> Result<Vec<String>, CastorError> {
    let sql = format!(
        r"SELECT name FROM {}.sqlite_master
          WHERE type = 'table' AND name NOT LIKE 'sqlite\_%' ESCAPE '\'
          ORDER BY name",
        schema.quoted()
    );
    let names = sqlx::query_scalar::<_, String>(&sql)
        .fetch_all(&mut *conn)
        .await?;
    Ok(names)
}

pub async fn sqlite_table_exists(
    conn: &mut SqliteConnection,
    schema: &Ident,
    table: &str,
) -> Result<bool, CastorError> {
    let sql = format!(
        "SELECT 1 FROM {}.sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
        schema.quoted()
    );
    let found = sqlx::query_scalar::<_, i64>(&sql)
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

pub async fn sqlite_table(
    conn: &mut SqliteConnection,
    schema: &Ident,
    table: &str,
) -> Result<TableInfo, CastorError> {
    // pk is the 1-based key position; hidden is 1 for virtual-table columns, 2 and 3 for
    // generated columns.
    let rows = sqlx::query_as::<_, (String, String, i64, i64)>(
        "SELECT name, type, pk, hidden FROM pragma_table_xinfo(?1, ?2)
         WHERE hidden <> 1 ORDER BY cid",
    )
    .bind(table)
    .bind(schema.as_str())
    .fetch_all(&mut *conn)
    .await?;

    let mut keyed: Vec<(i64, String)> = rows
        .iter()
        .filter(|(_, _, pk, _)| *pk > 0)
        .map(|(name, _, pk, _)| (*pk, name.clone()))
        .collect();
    keyed.sort_by_key(|(pk, _)| *pk);

    Ok(TableInfo {
        name: table.to_string(),
        columns: rows
            .into_iter()
            .map(|(name, type_name, _, hidden)| ColumnInfo {
                name,
                type_name,
                generated: hidden >= 2,
            })
            .collect(),
        primary_key: keyed.into_iter().map(|(_, name)| name).collect(),
    })
}

/// `CREATE TABLE` text stored in `sqlite_master`.
pub async fn sqlite_table_sql(
    conn: &mut SqliteConnection,
    schema: &Ident,
    table: &str,
) -> Result<Option<String>, CastorError> {
    let sql = format!(
        "SELECT sql FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
        schema.quoted()
    );
    let ddl = sqlx::query_scalar::<_, Option<String>>(&sql)
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(ddl.flatten())
}

// ---- Postgres ----

pub async fn pg_tables(conn: &mut PgConnection, schema: &str) -> Result<Vec<String>, CastorError> {
    let names = sqlx::query_scalar::<_, String>(
        "SELECT table_name::text FROM information_schema.tables
         WHERE table_schema = $1 AND table_type = 'BASE TABLE'
         ORDER BY table_name",
    )
    .bind(schema)
    .fetch_all(&mut *conn)
    .await?;
    Ok(names)
}

pub async fn pg_table_exists(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
) -> Result<bool, CastorError> {
    let found = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = $1 AND table_name = $2 AND table_type = 'BASE TABLE'
         )",
    )
    .bind(schema)
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;
    Ok(found)
}

pub async fn pg_schema_exists(conn: &mut PgConnection, schema: &str) -> Result<bool, CastorError> {
    let found = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
    )
    .bind(schema)
    .fetch_one(&mut *conn)
    .await?;
    Ok(found)
}

pub async fn pg_table(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
) -> Result<TableInfo, CastorError> {
    let columns = sqlx::query_as::<_, (String, String, bool)>(
        "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), a.attgenerated <> ''
         FROM pg_attribute a
         JOIN pg_class c ON c.oid = a.attrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1 AND c.relname = $2
           AND a.attnum > 0 AND NOT a.attisdropped
         ORDER BY a.attnum",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    let primary_key = sqlx::query_scalar::<_, String>(
        "SELECT a.attname::text
         FROM pg_index i
         JOIN pg_class c ON c.oid = i.indrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
         JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = k.attnum
         WHERE i.indisprimary AND n.nspname = $1 AND c.relname = $2
         ORDER BY k.ord",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    Ok(TableInfo {
        name: table.to_string(),
        columns: columns
            .into_iter()
            .map(|(name, type_name, generated)| ColumnInfo {
                name,
                type_name,
                generated,
            })
            .collect(),
        primary_key,
    })
}
