//! Runs only when `CASTOR_TEST_PG_URL` points at a disposable database.

use castor::config::MirrorConfig;
use castor::failover::{FailoverController, FailoverSettings};
use castor::mirror::MirrorService;
use castor_schema::MirrorMode;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

const TABLE: &str = "castor_it_cargos";
const SCHEMA: &str = "castor_it_mirror";

fn pg_url() -> Option<String> {
    std::env::var("CASTOR_TEST_PG_URL")
        .ok()
        .filter(|u| !u.trim().is_empty())
}

#[tokio::test]
async fn postgres_schema_mirror_setup_and_writes() {
    let Some(url) = pg_url() else {
        eprintln!("CASTOR_TEST_PG_URL not set; skipping");
        return;
    };

    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .expect("connect postgres");
    for stmt in [
        format!("DROP SCHEMA IF EXISTS {SCHEMA} CASCADE"),
        format!("DROP TABLE IF EXISTS public.{TABLE} CASCADE"),
        format!("DROP FUNCTION IF EXISTS public.trg_mirror_{TABLE}_fn() CASCADE"),
        format!(
            "CREATE TABLE public.{TABLE} (
                id_cargo integer GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                nombre_cargo varchar(100) NOT NULL,
                salario numeric(12, 2),
                nombre_upper text GENERATED ALWAYS AS (upper(nombre_cargo)) STORED
            )"
        ),
        format!("INSERT INTO public.{TABLE} (nombre_cargo, salario) VALUES ('Analista', 1200.50), ('Gerente', 3000)"),
    ] {
        sqlx::query(&stmt).execute(&admin).await.expect(&stmt);
    }

    let cfg = MirrorConfig {
        schema: SCHEMA.to_string(),
        allow_schema_ddl: true,
        ..MirrorConfig::default()
    };
    let settings = FailoverSettings {
        probe_timeout: Duration::from_secs(5),
        probe_retries: 0,
        ..FailoverSettings::default()
    };
    let controller =
        FailoverController::initialize(&url, None, None, settings).expect("controller");
    assert!(!controller.failover_enabled());
    let service = MirrorService::new(controller.clone(), &cfg, None).expect("mirror service");
    assert_eq!(service.mode(), MirrorMode::Schema);

    let first = service.setup(true).await.expect("first setup");
    assert!(first.tables_created.contains(&TABLE.to_string()), "{first:?}");
    assert!(
        first.errors.iter().all(|e| e.table != TABLE),
        "{:?}",
        first.errors
    );
    let second = service.setup(true).await.expect("second setup");
    assert!(!second.tables_created.contains(&TABLE.to_string()));

    for stmt in [
        format!("INSERT INTO public.{TABLE} (nombre_cargo, salario) VALUES ('Contador', 1800)"),
        format!("UPDATE public.{TABLE} SET nombre_cargo = 'Gerente General' WHERE id_cargo = 2"),
        format!("DELETE FROM public.{TABLE} WHERE id_cargo = 1"),
    ] {
        sqlx::query(&stmt).execute(&admin).await.expect(&stmt);
    }

    let preview = service.preview(TABLE, 50).await.expect("preview");
    assert_eq!(preview.rows.len(), 2);
    assert_eq!(preview.rows[0]["id_cargo"], json!(3));
    assert_eq!(preview.rows[1]["nombre_cargo"], json!("Gerente General"));
    assert_eq!(preview.rows[1]["nombre_upper"], json!("GERENTE GENERAL"));
    // numeric is rendered as text
    assert_eq!(preview.rows[0]["salario"], json!("1800.00"));

    let tables = service.tables().await.expect("tables");
    assert!(tables.contains(&TABLE.to_string()));

    let status = service.status().await.expect("status");
    assert!(status.mirror_triggers_count >= 1);
    assert_eq!(status.attached, None);

    for stmt in [
        format!("DROP TABLE IF EXISTS public.{TABLE} CASCADE"),
        format!("DROP FUNCTION IF EXISTS public.trg_mirror_{TABLE}_fn() CASCADE"),
        format!("DROP SCHEMA IF EXISTS {SCHEMA} CASCADE"),
    ] {
        sqlx::query(&stmt).execute(&admin).await.expect(&stmt);
    }
    admin.close().await;
}

#[tokio::test]
async fn postgres_schema_setup_is_refused_without_ddl_opt_in() {
    let Some(url) = pg_url() else {
        eprintln!("CASTOR_TEST_PG_URL not set; skipping");
        return;
    };
    let controller = FailoverController::initialize(&url, None, None, FailoverSettings::default())
        .expect("controller");
    let service =
        MirrorService::new(controller, &MirrorConfig::default(), None).expect("mirror service");
    assert!(matches!(
        service.setup(true).await,
        Err(castor::CastorError::ProvisioningRefused(_))
    ));
}
