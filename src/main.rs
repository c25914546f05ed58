use castor::config::CONFIG;
use castor::db::{ConnectionTarget, redact_dsn};
use castor::failover::{FailoverController, FailoverSettings, monitor};
use castor::mirror::MirrorService;
use castor::server::{CastorState, castor_router};
use castor_schema::Role;
use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = &*CONFIG;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.basic.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false),
        )
        .init();

    let mirror_url = cfg.mirror_target_url();
    info!(
        primary = %redact_dsn(&cfg.database.primary_url),
        mirror = %mirror_url.as_deref().map_or_else(|| "<none>".to_string(), redact_dsn),
        mirror_path = %cfg.mirror.path.as_ref().map_or_else(|| "<none>".to_string(), |p| p.display().to_string()),
        loglevel = %cfg.basic.loglevel,
        listen_addr = %cfg.basic.listen_addr,
        listen_port = cfg.basic.listen_port,
    );

    let primary = ConnectionTarget::new(Role::Primary, cfg.database.primary_url.as_str())?;
    let attach = MirrorService::attach_spec(&primary, &cfg.mirror)?;
    let failover = FailoverController::initialize(
        &cfg.database.primary_url,
        mirror_url.as_deref(),
        attach,
        FailoverSettings::from_config(cfg),
    )?;
    let mirror = MirrorService::new(
        failover.clone(),
        &cfg.mirror,
        cfg.database.mirror_url.as_deref(),
    )?;

    let monitor = monitor::spawn(failover.clone(), cfg.failover.check_interval()).await?;

    if cfg.mirror.auto_setup {
        match mirror.auto_setup().await {
            Ok(Some(report)) => info!(
                tables_created = report.tables_created.len(),
                triggers_created = report.triggers_created,
                skipped = report.skipped_tables.len(),
                "mirror auto-setup done"
            ),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "mirror auto-setup failed; continuing without it"),
        }
    }

    let state = CastorState::new(
        failover.clone(),
        mirror,
        Some(monitor.clone()),
        Arc::from(cfg.basic.admin_key.as_str()),
    );
    let app = castor_router(state, Duration::from_secs(cfg.basic.request_timeout_secs.max(1)));

    let addr = SocketAddr::from((cfg.basic.listen_addr, cfg.basic.listen_port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    monitor.shutdown().await;
    failover.current().pool().close().await;
    info!("Server has shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
