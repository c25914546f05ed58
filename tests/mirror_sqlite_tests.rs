use castor::config::MirrorConfig;
use castor::db::{ConnectionTarget, Ident};
use castor::failover::{FailoverController, FailoverSettings};
use castor::mirror::{MirrorService, sqlite as sqlite_mirror};
use castor_schema::{MirrorMode, Role};
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

fn require_send<F: Future + Send>(fut: F) -> F {
    fut
}

fn temp_db(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_nanos();
    std::env::temp_dir().join(format!(
        "castor-{tag}-{}-{}.sqlite",
        std::process::id(),
        nanos
    ))
}

const CARGOS: &[&str] = &[
    "CREATE TABLE cargos (id_cargo INTEGER PRIMARY KEY AUTOINCREMENT, nombre_cargo TEXT NOT NULL)",
    "INSERT INTO cargos (nombre_cargo) VALUES ('Analista'), ('Gerente')",
    "CREATE TABLE notas (texto TEXT)",
    "INSERT INTO notas (texto) VALUES ('sin clave')",
    "CREATE TABLE alembic_version (version_num TEXT PRIMARY KEY)",
];

async fn seed_primary(url: &str, statements: &[&str]) {
    let opts = SqliteConnectOptions::from_str(url)
        .expect("valid sqlite url")
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .expect("open primary");
    for stmt in statements {
        sqlx::query(stmt).execute(&pool).await.expect(stmt);
    }
    pool.close().await;
}

fn settings() -> FailoverSettings {
    FailoverSettings {
        probe_timeout: Duration::from_secs(5),
        probe_retries: 0,
        ..FailoverSettings::default()
    }
}

async fn attached_service(primary: &Path, mirror: &Path) -> (FailoverController, MirrorService) {
    attached_service_with(primary, mirror, CARGOS).await
}

async fn attached_service_with(
    primary: &Path,
    mirror: &Path,
    statements: &[&str],
) -> (FailoverController, MirrorService) {
    let primary_url = format!("sqlite://{}", primary.display());
    let mirror_url = format!("sqlite://{}", mirror.display());
    seed_primary(&primary_url, statements).await;

    let cfg = MirrorConfig {
        path: Some(mirror.to_path_buf()),
        ..MirrorConfig::default()
    };
    let target = ConnectionTarget::new(Role::Primary, primary_url.as_str()).expect("target");
    let attach = MirrorService::attach_spec(&target, &cfg).expect("attach spec");
    let controller =
        FailoverController::initialize(&primary_url, Some(&mirror_url), attach, settings())
            .expect("controller");
    let service = MirrorService::new(controller.clone(), &cfg, None).expect("mirror service");
    (controller, service)
}

#[tokio::test]
async fn sqlite_mirror_setup_is_idempotent() {
    let primary = temp_db("mirror-idem");
    let mirror = temp_db("mirror-idem-copy");
    let (_controller, service) = attached_service(&primary, &mirror).await;
    assert_eq!(service.mode(), MirrorMode::Attached);

    // Handlers spawn this future on the multi-threaded runtime.
    let first = require_send(service.setup(true))
        .await
        .expect("first setup");
    assert!(first.tables_created.contains(&"cargos".to_string()));
    assert!(first.skipped_tables.contains(&"notas".to_string()));
    assert!(!first.tables_created.contains(&"alembic_version".to_string()));
    assert_eq!(first.triggers_created, 3);
    assert!(first.errors.is_empty());

    let second = service.setup(true).await.expect("second setup");
    assert!(second.tables_created.is_empty(), "{:?}", second.tables_created);
    assert_eq!(second.triggers_created, 3);
    assert!(second.errors.is_empty());

    let mut tables = service.tables().await.expect("tables");
    tables.sort();
    assert_eq!(tables, vec!["cargos".to_string(), "notas".to_string()]);

    let preview = service.preview("cargos", 50).await.expect("preview");
    assert_eq!(preview.columns, vec!["id_cargo", "nombre_cargo"]);
    assert_eq!(preview.rows.len(), 2);
    assert_eq!(preview.rows[0]["id_cargo"], json!(2));

    let status = service.status().await.expect("status");
    assert_eq!(status.attached, Some(true));
    assert_eq!(status.mirror_triggers_count, 3);
    assert_eq!(status.mirror_tables_count, 2);
    assert_eq!(status.current_active_db, Role::Primary);

    let _ = tokio::fs::remove_file(&primary).await;
    let _ = tokio::fs::remove_file(&mirror).await;
}

#[tokio::test]
async fn sqlite_mirror_follows_insert_update_delete() {
    let primary = temp_db("mirror-writes");
    let mirror = temp_db("mirror-writes-copy");
    let (controller, service) = attached_service(&primary, &mirror).await;
    service.setup(true).await.expect("setup");

    let active = controller.current();
    let pool = active.pool().as_sqlite().expect("sqlite pool");
    let schema = Ident::parse("mirror", "schema").expect("schema ident");
    {
        let mut conn = pool.acquire().await.expect("acquire");
        sqlx::query("INSERT INTO cargos (nombre_cargo) VALUES ('Contador')")
            .execute(&mut *conn)
            .await
            .expect("insert");
        sqlx::query("UPDATE cargos SET nombre_cargo = 'Gerente General' WHERE id_cargo = 2")
            .execute(&mut *conn)
            .await
            .expect("update");
        sqlx::query("DELETE FROM cargos WHERE id_cargo = 1")
            .execute(&mut *conn)
            .await
            .expect("delete");

        // The release hook of another connection may already have drained part of it.
        sqlite_mirror::apply_journal(&mut conn, &schema)
            .await
            .expect("apply journal");
        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _mirror_journal")
            .fetch_one(&mut *conn)
            .await
            .expect("journal count");
        assert_eq!(pending, 0);
    }

    let preview = service.preview("cargos", 50).await.expect("preview");
    let rows: Vec<(i64, String)> = preview
        .rows
        .iter()
        .map(|r| {
            (
                r["id_cargo"].as_i64().expect("integer id"),
                r["nombre_cargo"].as_str().expect("text name").to_string(),
            )
        })
        .collect();
    assert_eq!(
        rows,
        vec![
            (3, "Contador".to_string()),
            (2, "Gerente General".to_string())
        ]
    );

    // A key change is journaled under both keys.
    {
        let mut conn = pool.acquire().await.expect("acquire");
        sqlx::query("UPDATE cargos SET id_cargo = 10 WHERE id_cargo = 3")
            .execute(&mut *conn)
            .await
            .expect("rekey");
        sqlite_mirror::apply_journal(&mut conn, &schema)
            .await
            .expect("apply journal");
    }
    let preview = service.preview("cargos", 1).await.expect("preview");
    assert_eq!(preview.rows.len(), 1);
    assert_eq!(preview.rows[0]["id_cargo"], json!(10));
    let all = service.preview("cargos", 500).await.expect("preview");
    assert_eq!(all.rows.len(), 2);

    let _ = tokio::fs::remove_file(&primary).await;
    let _ = tokio::fs::remove_file(&mirror).await;
}

#[tokio::test]
async fn sqlite_preview_rejects_unknown_and_unsafe_tables() {
    let primary = temp_db("mirror-preview");
    let mirror = temp_db("mirror-preview-copy");
    let (_controller, service) = attached_service(&primary, &mirror).await;
    service.setup(false).await.expect("setup");

    let empty = service.preview("cargos", 0).await.expect("limit 0");
    assert!(empty.rows.is_empty());
    assert_eq!(empty.columns, vec!["id_cargo", "nombre_cargo"]);

    // copy_data = false leaves the fresh mirror table empty.
    let uncopied = service.preview("cargos", 50).await.expect("preview");
    assert!(uncopied.rows.is_empty());

    assert!(matches!(
        service.preview("no_such_table", 10).await,
        Err(castor::CastorError::TableNotFound(_))
    ));
    assert!(matches!(
        service.preview("_mirror_journal", 10).await,
        Err(castor::CastorError::TableNotFound(_))
    ));
    assert!(matches!(
        service.preview("cargos; DROP TABLE cargos", 10).await,
        Err(castor::CastorError::IdentifierRejected { .. })
    ));

    let _ = tokio::fs::remove_file(&primary).await;
    let _ = tokio::fs::remove_file(&mirror).await;
}

#[tokio::test]
async fn sqlite_mirror_tracks_every_key_affinity() {
    let primary = temp_db("mirror-keys");
    let mirror = temp_db("mirror-keys-copy");
    let (controller, service) = attached_service_with(
        &primary,
        &mirror,
        &[
            "CREATE TABLE docs (id BLOB PRIMARY KEY, v TEXT)",
            "CREATE TABLE medidas (valor REAL PRIMARY KEY, nota TEXT)",
            "CREATE TABLE codigos (codigo TEXT PRIMARY KEY, nombre TEXT)",
            "INSERT INTO codigos VALUES ('007', 'agente'), ('7', 'numero')",
            "CREATE TABLE asignaciones (id_empleado INTEGER, id_cargo INTEGER, desde TEXT, \
             PRIMARY KEY (id_empleado, id_cargo))",
            "INSERT INTO asignaciones VALUES (1, 1, '2023'), (1, 2, '2024')",
        ],
    )
    .await;
    let setup = service.setup(true).await.expect("setup");
    assert!(setup.errors.is_empty(), "{:?}", setup.errors);
    assert_eq!(setup.triggers_created, 12);

    let valor = 0.123_456_789_012_345_68_f64;
    let active = controller.current();
    let pool = active.pool().as_sqlite().expect("sqlite pool");
    let schema = Ident::parse("mirror", "schema").expect("schema ident");
    let mut conn = pool.acquire().await.expect("acquire");
    for stmt in [
        "INSERT INTO docs VALUES (x'0102', 'uno'), (x'03', 'tres')",
        "UPDATE docs SET v = 'uno bis' WHERE id = x'0102'",
        "DELETE FROM docs WHERE id = x'03'",
        "DELETE FROM codigos WHERE codigo = '7'",
        "UPDATE codigos SET nombre = 'agente doble' WHERE codigo = '007'",
        "DELETE FROM asignaciones WHERE id_empleado = 1 AND id_cargo = 1",
        "UPDATE asignaciones SET desde = '2025' WHERE id_empleado = 1 AND id_cargo = 2",
        "INSERT INTO asignaciones VALUES (2, 1, '2025')",
    ] {
        sqlx::query(stmt).execute(&mut *conn).await.expect(stmt);
    }
    sqlx::query("INSERT INTO medidas VALUES (?1, 'precisa')")
        .bind(valor)
        .execute(&mut *conn)
        .await
        .expect("insert real key");
    sqlx::query("UPDATE medidas SET nota = 'precisa bis' WHERE valor = ?1")
        .bind(valor)
        .execute(&mut *conn)
        .await
        .expect("update real key");

    sqlite_mirror::apply_journal(&mut conn, &schema)
        .await
        .expect("apply journal");

    let docs: Vec<(Vec<u8>, String)> =
        sqlx::query_as(r#"SELECT id, v FROM "mirror"."docs" ORDER BY id"#)
            .fetch_all(&mut *conn)
            .await
            .expect("mirror docs");
    assert_eq!(docs, vec![(vec![1, 2], "uno bis".to_string())]);

    let medidas: Vec<(f64, String)> =
        sqlx::query_as(r#"SELECT valor, nota FROM "mirror"."medidas""#)
            .fetch_all(&mut *conn)
            .await
            .expect("mirror medidas");
    assert_eq!(medidas.len(), 1);
    assert_eq!(medidas[0].0.to_bits(), valor.to_bits());
    assert_eq!(medidas[0].1, "precisa bis");

    let codigos: Vec<(String, String)> =
        sqlx::query_as(r#"SELECT codigo, nombre FROM "mirror"."codigos" ORDER BY codigo"#)
            .fetch_all(&mut *conn)
            .await
            .expect("mirror codigos");
    assert_eq!(
        codigos,
        vec![("007".to_string(), "agente doble".to_string())]
    );

    let asignaciones: Vec<(i64, i64, String)> = sqlx::query_as(
        r#"SELECT id_empleado, id_cargo, desde FROM "mirror"."asignaciones"
           ORDER BY id_empleado, id_cargo"#,
    )
    .fetch_all(&mut *conn)
    .await
    .expect("mirror asignaciones");
    assert_eq!(
        asignaciones,
        vec![(1, 2, "2025".to_string()), (2, 1, "2025".to_string())]
    );

    // The mirror copy keeps the source keys.
    let pk_columns: i64 = sqlx::query_scalar(
        r#"SELECT COUNT(*) FROM pragma_table_info('asignaciones', 'mirror') WHERE pk > 0"#,
    )
    .fetch_one(&mut *conn)
    .await
    .expect("mirror key columns");
    assert_eq!(pk_columns, 2);
    drop(conn);

    let _ = tokio::fs::remove_file(&primary).await;
    let _ = tokio::fs::remove_file(&mirror).await;
}
