//! Row-to-JSON conversion for mirror previews.
//!
//! Dates and times become ISO-8601 strings, binary becomes lowercase hex, uuids become
//! strings and json stays json. Postgres numerics (and any type without a native decoder
//! here) are cast to `text` in the select list, see [`pg_select_expr`].

use super::ident::Ident;
use crate::error::CastorError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Number, Value};
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::types::Uuid;
use sqlx::{Column, Row, TypeInfo, ValueRef};

pub type JsonRow = Map<String, Value>;

pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

pub fn sqlite_row_to_json(row: &SqliteRow) -> Result<JsonRow, CastorError> {
    let mut out = Map::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            // Storage class of this value, not the declared column type.
            let storage = raw.type_info().name().to_ascii_uppercase();
            match storage.as_str() {
                "INTEGER" | "INT" | "BIGINT" => Value::from(row.try_get::<i64, _>(i)?),
                "REAL" => float(row.try_get::<f64, _>(i)?),
                "BLOB" => Value::String(to_hex(&row.try_get::<Vec<u8>, _>(i)?)),
                "BOOLEAN" => Value::Bool(row.try_get::<bool, _>(i)?),
                _ => Value::String(row.try_get::<String, _>(i)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

/// Type prefixes that [`pg_row_to_json`] decodes natively.
const PG_NATIVE_TYPES: &[&str] = &[
    "boolean",
    "smallint",
    "integer",
    "bigint",
    "real",
    "double precision",
    "text",
    "character varying",
    "character",
    "name",
    "date",
    "time without time zone",
    "timestamp without time zone",
    "timestamp with time zone",
    "bytea",
    "uuid",
    "json",
    "jsonb",
];

/// Select-list expression for one column; unknown types are cast to text.
pub fn pg_select_expr(column: &Ident, type_name: &str) -> String {
    let base = type_name
        .split('(')
        .next()
        .unwrap_or(type_name)
        .trim()
        .to_ascii_lowercase();
    if base.ends_with("[]") || !PG_NATIVE_TYPES.contains(&base.as_str()) {
        format!("{col}::text AS {col}", col = column.quoted())
    } else {
        column.quoted()
    }
}

pub fn pg_row_to_json(row: &PgRow) -> Result<JsonRow, CastorError> {
    let mut out = Map::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_ascii_uppercase();
            match type_name.as_str() {
                "BOOL" => Value::Bool(row.try_get::<bool, _>(i)?),
                "INT2" => Value::from(row.try_get::<i16, _>(i)?),
                "INT4" => Value::from(row.try_get::<i32, _>(i)?),
                "INT8" => Value::from(row.try_get::<i64, _>(i)?),
                "FLOAT4" => float(f64::from(row.try_get::<f32, _>(i)?)),
                "FLOAT8" => float(row.try_get::<f64, _>(i)?),
                "DATE" => Value::String(row.try_get::<NaiveDate, _>(i)?.to_string()),
                "TIME" => Value::String(
                    row.try_get::<NaiveTime, _>(i)?
                        .format("%H:%M:%S%.f")
                        .to_string(),
                ),
                "TIMESTAMP" => Value::String(
                    row.try_get::<NaiveDateTime, _>(i)?
                        .format("%Y-%m-%dT%H:%M:%S%.f")
                        .to_string(),
                ),
                "TIMESTAMPTZ" => Value::String(row.try_get::<DateTime<Utc>, _>(i)?.to_rfc3339()),
                "BYTEA" => Value::String(to_hex(&row.try_get::<Vec<u8>, _>(i)?)),
                "UUID" => Value::String(row.try_get::<Uuid, _>(i)?.to_string()),
                "JSON" | "JSONB" => row.try_get::<Value, _>(i)?,
                _ => Value::String(row.try_get::<String, _>(i)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}
