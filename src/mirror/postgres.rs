//! Same-instance schema mirroring for Postgres.
//!
//! Every public table gets a twin in the mirror schema plus a row trigger on the source that
//! upserts (or deletes) the affected row. DDL here takes ACCESS EXCLUSIVE locks on the source
//! tables while it runs.

use crate::db::ident::{Ident, column_list, qualified, validate_type_name};
use crate::db::introspect::{self, MirrorTableSpec};
use crate::error::CastorError;
use castor_schema::{MirrorSetupResponse, TableError};
use sqlx::{Connection, PgConnection, PgPool};
use std::collections::HashSet;
use tracing::{info, warn};

pub const SOURCE_SCHEMA: &str = "public";

fn public() -> Ident {
    Ident::from_static(SOURCE_SCHEMA)
}

fn function_name(table: &Ident) -> Result<Ident, CastorError> {
    Ident::derived("trg_mirror_", table, "_fn", "function")
}

fn trigger_name(table: &Ident) -> Result<Ident, CastorError> {
    Ident::derived("trg_mirror_", table, "", "trigger")
}

fn index_name(table: &Ident) -> Result<Ident, CastorError> {
    Ident::derived("ux_mirror_", table, "_pk", "index")
}

fn key_match(spec: &MirrorTableSpec, row: &str) -> String {
    spec.primary_key
        .iter()
        .map(|c| format!("{col} = {row}{col}", col = c.quoted()))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `CREATE OR REPLACE FUNCTION` for the row trigger of one table.
///
/// INSERT and UPDATE upsert on the key; an UPDATE that changes the key first removes the old
/// key. DELETE removes by key.
pub fn function_sql(schema: &Ident, spec: &MirrorTableSpec) -> Result<String, CastorError> {
    let function = function_name(&spec.table)?;
    let mirror = qualified(schema, &spec.table);
    let cols = column_list(&spec.columns, "");
    let new_values = column_list(&spec.columns, "NEW.");
    let pk = column_list(&spec.primary_key, "");
    let old_pk = column_list(&spec.primary_key, "OLD.");
    let new_pk = column_list(&spec.primary_key, "NEW.");

    let mut set_clause = spec
        .non_key_columns()
        .map(|c| format!("{col} = EXCLUDED.{col}", col = c.quoted()))
        .collect::<Vec<_>>()
        .join(", ");
    if set_clause.is_empty() {
        set_clause = spec
            .primary_key
            .iter()
            .map(|c| format!("{col} = EXCLUDED.{col}", col = c.quoted()))
            .collect::<Vec<_>>()
            .join(", ");
    }
    let where_old = key_match(spec, "OLD.");

    Ok(format!(
        "CREATE OR REPLACE FUNCTION {function}()
RETURNS trigger
LANGUAGE plpgsql
AS $castor$
BEGIN
    IF (TG_OP = 'DELETE') THEN
        DELETE FROM {mirror} WHERE {where_old};
        RETURN OLD;
    END IF;
    IF (TG_OP = 'UPDATE') AND ROW({old_pk}) IS DISTINCT FROM ROW({new_pk}) THEN
        DELETE FROM {mirror} WHERE {where_old};
    END IF;
    INSERT INTO {mirror} ({cols}) OVERRIDING SYSTEM VALUE
    VALUES ({new_values})
    ON CONFLICT ({pk}) DO UPDATE SET {set_clause};
    RETURN NEW;
END;
$castor$",
        function = qualified(&public(), &function),
    ))
}

pub fn trigger_sql(spec: &MirrorTableSpec) -> Result<(String, String), CastorError> {
    let trigger = trigger_name(&spec.table)?;
    let function = function_name(&spec.table)?;
    let source = qualified(&public(), &spec.table);
    let drop = format!("DROP TRIGGER IF EXISTS {} ON {source}", trigger.quoted());
    let create = format!(
        "CREATE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {source} \
         FOR EACH ROW EXECUTE FUNCTION {}()",
        trigger.quoted(),
        qualified(&public(), &function),
    );
    Ok((drop, create))
}

struct TableOutcome {
    created: bool,
    trigger: bool,
}

async fn exec(conn: &mut PgConnection, sql: &str) -> Result<(), CastorError> {
    sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql)).await?;
    Ok(())
}

async fn provision_table(
    conn: &mut PgConnection,
    schema: &Ident,
    spec: &MirrorTableSpec,
    copy_data: bool,
) -> Result<TableOutcome, CastorError> {
    let mirror = qualified(schema, &spec.table);
    let source = qualified(&public(), &spec.table);

    let exists = introspect::pg_table_exists(conn, schema.as_str(), spec.table.as_str()).await?;
    exec(
        conn,
        &format!(
            "CREATE TABLE IF NOT EXISTS {mirror} \
             (LIKE {source} INCLUDING DEFAULTS INCLUDING IDENTITY INCLUDING GENERATED)"
        ),
    )
    .await?;

    if exists {
        let present: HashSet<String> =
            introspect::pg_table(conn, schema.as_str(), spec.table.as_str())
                .await?
                .columns
                .into_iter()
                .map(|c| c.name)
                .collect();
        for (column, type_name) in spec.columns.iter().zip(&spec.column_types) {
            if present.contains(column.as_str()) {
                continue;
            }
            let type_name = validate_type_name(type_name)?;
            exec(
                conn,
                &format!(
                    "ALTER TABLE {mirror} ADD COLUMN IF NOT EXISTS {} {type_name}",
                    column.quoted()
                ),
            )
            .await?;
            info!(table = %spec.table, column = %column, "added missing mirror column");
        }
    }

    if !spec.primary_key.is_empty() {
        exec(
            conn,
            &format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {mirror} ({})",
                index_name(&spec.table)?.quoted(),
                column_list(&spec.primary_key, "")
            ),
        )
        .await?;
    }

    if copy_data {
        let cols = column_list(&spec.columns, "");
        exec(conn, &format!("TRUNCATE TABLE {mirror}")).await?;
        exec(
            conn,
            &format!(
                "INSERT INTO {mirror} ({cols}) OVERRIDING SYSTEM VALUE SELECT {cols} FROM {source}"
            ),
        )
        .await?;
    }

    let (drop_trigger, create_trigger) = trigger_sql(spec)?;
    exec(conn, &drop_trigger).await?;
    if spec.primary_key.is_empty() {
        return Ok(TableOutcome {
            created: !exists,
            trigger: false,
        });
    }
    exec(conn, &function_sql(schema, spec)?).await?;
    exec(conn, &create_trigger).await?;

    Ok(TableOutcome {
        created: !exists,
        trigger: true,
    })
}

/// Builds or repairs the schema mirror in one transaction, one savepoint per table.
pub async fn setup(
    pool: &PgPool,
    schema: &Ident,
    excluded: &[String],
    copy_data: bool,
) -> Result<MirrorSetupResponse, CastorError> {
    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    exec(&mut tx, &format!("CREATE SCHEMA IF NOT EXISTS {}", schema.quoted()))
        .await
        .map_err(|e| CastorError::Provisioning(format!("cannot create schema {schema}: {e}")))?;

    let tables = introspect::pg_tables(&mut tx, SOURCE_SCHEMA).await?;
    let mut result = MirrorSetupResponse {
        mirror_schema: schema.to_string(),
        mirror_path: None,
        tables_created: Vec::new(),
        triggers_created: 0,
        skipped_tables: Vec::new(),
        errors: Vec::new(),
    };

    for table in tables {
        if excluded.contains(&table) {
            continue;
        }
        let info = introspect::pg_table(&mut tx, SOURCE_SCHEMA, &table).await?;
        let spec = match MirrorTableSpec::from_info(&info) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(table = %table, error = %e, "skipping table with unsafe identifiers");
                result.skipped_tables.push(table);
                continue;
            }
        };

        let mut savepoint = tx.begin().await?;
        match provision_table(&mut savepoint, schema, &spec, copy_data).await {
            Ok(outcome) => {
                savepoint.commit().await?;
                if outcome.created {
                    result.tables_created.push(table.clone());
                }
                if outcome.trigger {
                    result.triggers_created += 1;
                } else {
                    result.skipped_tables.push(table);
                }
            }
            Err(e) => {
                savepoint.rollback().await?;
                warn!(table = %table, error = %e, "mirror setup failed for table");
                result.errors.push(TableError {
                    table: table.clone(),
                    message: e.to_string(),
                });
                result.skipped_tables.push(table);
            }
        }
    }

    tx.commit().await?;
    info!(
        created = result.tables_created.len(),
        triggers = result.triggers_created,
        skipped = result.skipped_tables.len(),
        errors = result.errors.len(),
        "postgres schema mirror setup finished"
    );
    Ok(result)
}

/// Mirror triggers installed on public tables.
pub async fn trigger_count(conn: &mut PgConnection) -> Result<i64, CastorError> {
    let count = sqlx::query_scalar::<_, i64>(
        r"SELECT COUNT(*)
          FROM pg_trigger t
          JOIN pg_class c ON c.oid = t.tgrelid
          JOIN pg_namespace n ON n.oid = c.relnamespace
          WHERE t.tgname LIKE 'trg\_mirror\_%' AND n.nspname = 'public'",
    )
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// Whether boot-time setup still has work to do.
pub async fn needs_setup(pool: &PgPool, schema: &Ident) -> Result<bool, CastorError> {
    let mut conn = pool.acquire().await?;
    let schema_exists = introspect::pg_schema_exists(&mut conn, schema.as_str()).await?;
    let triggers = trigger_count(&mut conn).await?;
    Ok(!schema_exists || triggers == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::introspect::{ColumnInfo, TableInfo};

    fn spec(cols: &[&str], pk: &[&str]) -> MirrorTableSpec {
        MirrorTableSpec::from_info(&TableInfo {
            name: "cargos".to_string(),
            columns: cols
                .iter()
                .map(|c| ColumnInfo {
                    name: (*c).to_string(),
                    type_name: "integer".to_string(),
                    generated: false,
                })
                .collect(),
            primary_key: pk.iter().map(|c| (*c).to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn function_upserts_and_handles_key_changes() {
        let schema = Ident::parse("mirror", "schema").unwrap();
        let sql = function_sql(&schema, &spec(&["id_cargo", "nombre_cargo"], &["id_cargo"])).unwrap();
        assert!(sql.starts_with("CREATE OR REPLACE FUNCTION \"public\".\"trg_mirror_cargos_fn\"()"));
        assert!(sql.contains("DELETE FROM \"mirror\".\"cargos\" WHERE \"id_cargo\" = OLD.\"id_cargo\";"));
        assert!(sql.contains("ROW(OLD.\"id_cargo\") IS DISTINCT FROM ROW(NEW.\"id_cargo\")"));
        assert!(sql.contains("ON CONFLICT (\"id_cargo\") DO UPDATE SET \"nombre_cargo\" = EXCLUDED.\"nombre_cargo\";"));
    }

    #[test]
    fn key_only_tables_still_have_a_set_clause() {
        let schema = Ident::parse("mirror", "schema").unwrap();
        let sql = function_sql(&schema, &spec(&["a", "b"], &["a", "b"])).unwrap();
        assert!(sql.contains("DO UPDATE SET \"a\" = EXCLUDED.\"a\", \"b\" = EXCLUDED.\"b\";"));
        assert!(sql.contains("WHERE \"a\" = OLD.\"a\" AND \"b\" = OLD.\"b\";"));
    }

    #[test]
    fn trigger_statements_are_deterministic() {
        let (drop, create) = trigger_sql(&spec(&["id_cargo"], &["id_cargo"])).unwrap();
        assert_eq!(
            drop,
            "DROP TRIGGER IF EXISTS \"trg_mirror_cargos\" ON \"public\".\"cargos\""
        );
        assert!(create.contains("AFTER INSERT OR UPDATE OR DELETE ON \"public\".\"cargos\""));
        assert!(create.ends_with("EXECUTE FUNCTION \"public\".\"trg_mirror_cargos_fn\"()"));
    }
}
