use super::sqlite::JOURNAL_TABLE;
use crate::db::ident::Ident;
use crate::db::introspect;
use crate::db::value::{pg_row_to_json, pg_select_expr, sqlite_row_to_json};
use crate::error::CastorError;
use castor_schema::TablePreview;
use sqlx::{PgConnection, SqliteConnection};

pub const DEFAULT_PREVIEW_LIMIT: i64 = 50;
pub const MAX_PREVIEW_LIMIT: i64 = 500;

/// Parses the `limit` query parameter; absent means the default, valid range is `0..=500`.
pub fn parse_limit(raw: Option<&str>) -> Result<i64, CastorError> {
    let Some(raw) = raw.map(str::trim) else {
        return Ok(DEFAULT_PREVIEW_LIMIT);
    };
    let limit: i64 = raw
        .parse()
        .map_err(|_| CastorError::InvalidLimit(format!("limit must be an integer, got {raw:?}")))?;
    if !(0..=MAX_PREVIEW_LIMIT).contains(&limit) {
        return Err(CastorError::InvalidLimit(format!(
            "limit must be between 0 and {MAX_PREVIEW_LIMIT}, got {limit}"
        )));
    }
    Ok(limit)
}

pub async fn sqlite_tables(
    conn: &mut SqliteConnection,
    schema: &Ident,
) -> Result<Vec<String>, CastorError> {
    let mut tables = introspect::sqlite_tables(conn, schema).await?;
    tables.retain(|t| t != JOURNAL_TABLE);
    Ok(tables)
}

/// First rows of `schema.table`, newest key first.
///
/// The ordering key is looked up in `key_schema` (the source) when the table itself has
/// none, and falls back to rowid order.
pub async fn sqlite_preview(
    conn: &mut SqliteConnection,
    schema: &Ident,
    key_schema: &Ident,
    table: &str,
    limit: i64,
) -> Result<TablePreview, CastorError> {
    let table_ident = Ident::parse(table, "table")?;
    if table == JOURNAL_TABLE || !introspect::sqlite_table_exists(conn, schema, table).await? {
        return Err(CastorError::TableNotFound(table.to_string()));
    }

    let info = introspect::sqlite_table(conn, schema, table).await?;
    let columns: Vec<String> = info.columns.iter().map(|c| c.name.clone()).collect();
    let mut key = info.primary_key.first().cloned();
    if key.is_none() && key_schema != schema {
        key = introspect::sqlite_table(conn, key_schema, table)
            .await?
            .primary_key
            .into_iter()
            .find(|k| columns.contains(k));
    }
    // Keyless copies are rowid tables; newest insert first.
    let order_by = match key {
        Some(k) => format!(" ORDER BY {} DESC", Ident::parse(&k, "column")?.quoted()),
        None => " ORDER BY rowid DESC".to_string(),
    };

    let sql = format!(
        "SELECT * FROM {}.{}{order_by} LIMIT ?1",
        schema.quoted(),
        table_ident.quoted()
    );
    let rows = sqlx::query(&sql)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(sqlite_row_to_json)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TablePreview {
        table: table.to_string(),
        columns,
        rows,
    })
}

pub async fn pg_tables(conn: &mut PgConnection, schema: &str) -> Result<Vec<String>, CastorError> {
    introspect::pg_tables(conn, schema).await
}

/// Postgres counterpart of [`sqlite_preview`]; unknown types are rendered as text.
pub async fn pg_preview(
    conn: &mut PgConnection,
    schema: &Ident,
    key_schema: &Ident,
    table: &str,
    limit: i64,
) -> Result<TablePreview, CastorError> {
    let table_ident = Ident::parse(table, "table")?;
    if !introspect::pg_table_exists(conn, schema.as_str(), table).await? {
        return Err(CastorError::TableNotFound(table.to_string()));
    }

    let info = introspect::pg_table(conn, schema.as_str(), table).await?;
    let columns: Vec<String> = info.columns.iter().map(|c| c.name.clone()).collect();
    let mut key = info.primary_key.first().cloned();
    if key.is_none() && key_schema != schema {
        key = introspect::pg_table(conn, key_schema.as_str(), table)
            .await?
            .primary_key
            .into_iter()
            .find(|k| columns.contains(k));
    }
    let order_by = match key {
        Some(k) => format!(" ORDER BY {} DESC", Ident::parse(&k, "column")?.quoted()),
        None => String::new(),
    };

    let select_list = info
        .columns
        .iter()
        .map(|c| Ident::parse(&c.name, "column").map(|col| pg_select_expr(&col, &c.type_name)))
        .collect::<Result<Vec<_>, _>>()?;
    let select_list = if select_list.is_empty() {
        "*".to_string()
    } else {
        select_list.join(", ")
    };

    let sql = format!(
        "SELECT {select_list} FROM {}.{}{order_by} LIMIT $1",
        schema.quoted(),
        table_ident.quoted()
    );
    let rows = sqlx::query(&sql)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(pg_row_to_json)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TablePreview {
        table: table.to_string(),
        columns,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_bounds() {
        assert_eq!(parse_limit(None).unwrap(), DEFAULT_PREVIEW_LIMIT);
        assert_eq!(parse_limit(Some("0")).unwrap(), 0);
        assert_eq!(parse_limit(Some("500")).unwrap(), 500);
        for bad in ["501", "-1", "abc", "", "1.5"] {
            assert!(
                matches!(parse_limit(Some(bad)), Err(CastorError::InvalidLimit(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
