use super::{marker, prepare};
use crate::config::Config;
use crate::db::{AttachSpec, ConnectionTarget, DbPool, ProbeStatus, probe, try_probe};
use crate::error::{CastorError, IsRetryable};
use backon::{ExponentialBuilder, Retryable};
use castor_schema::{DatabaseStatusResponse, PrepareReport, Role, TargetInfo};
use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Failover policy knobs, resolved once at boot.
#[derive(Debug, Clone)]
pub struct FailoverSettings {
    pub probe_timeout: Duration,
    pub probe_retries: usize,
    pub auto_failover: bool,
    pub auto_failback: bool,
    pub failback_min_interval: Duration,
    pub marker_path: Option<PathBuf>,
    /// Subscriptions to drop on promotion; empty means every subscription of the database.
    pub subscriptions: Vec<String>,
    pub excluded_tables: Vec<String>,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl FailoverSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            probe_timeout: cfg.failover.probe_timeout(),
            probe_retries: cfg.failover.probe_retries,
            auto_failover: cfg.failover.auto_failover,
            auto_failback: cfg.failover.auto_failback,
            failback_min_interval: cfg.failover.failback_min_interval(),
            marker_path: cfg.failover.marker_path.clone(),
            subscriptions: cfg.mirror.subscriptions.clone(),
            excluded_tables: cfg.mirror.excluded_tables.clone(),
        }
    }
}

/// Immutable snapshot of the database currently serving traffic.
#[derive(Debug)]
pub struct ActiveDatabase {
    role: Role,
    target: ConnectionTarget,
    pool: DbPool,
    persisted: bool,
}

impl ActiveDatabase {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Whether the role survives a restart through the failover marker.
    pub fn persisted(&self) -> bool {
        self.persisted
    }
}

#[derive(Debug)]
pub enum SwitchOutcome {
    Unchanged,
    Switched { prepare: Option<PrepareReport> },
}

impl SwitchOutcome {
    pub fn switched(&self) -> bool {
        matches!(self, SwitchOutcome::Switched { .. })
    }
}

struct ControllerInner {
    primary: ConnectionTarget,
    mirror: Option<ConnectionTarget>,
    attach: Option<AttachSpec>,
    settings: FailoverSettings,
    active: RwLock<Arc<ActiveDatabase>>,
    switch_lock: tokio::sync::Mutex<()>,
    failback_limiter: DefaultDirectRateLimiter,
    available: AtomicBool,
}

/// Owns the primary/mirror state machine. Cheap to clone.
#[derive(Clone)]
pub struct FailoverController {
    inner: Arc<ControllerInner>,
}

impl FailoverController {
    /// Records both targets and builds a lazily connecting pool for the boot role.
    ///
    /// Without a mirror DSN failover is disabled. No connection is opened here.
    pub fn initialize(
        primary_dsn: &str,
        mirror_dsn: Option<&str>,
        attach: Option<AttachSpec>,
        settings: FailoverSettings,
    ) -> Result<Self, CastorError> {
        let primary = ConnectionTarget::new(Role::Primary, primary_dsn)?;
        let mirror = mirror_dsn
            .map(|dsn| ConnectionTarget::new(Role::Mirror, dsn))
            .transpose()?;

        if let Some(mirror) = &mirror
            && mirror.dialect() != primary.dialect()
        {
            warn!(
                primary = %primary.dialect(),
                mirror = %mirror.dialect(),
                "primary and mirror use different dialects"
            );
        }

        let role = match &settings.marker_path {
            Some(path) => marker::initial_role(path, mirror.as_ref()),
            None => Role::Primary,
        };
        let (target, attach_for_pool, persisted) = match (role, &mirror) {
            (Role::Mirror, Some(m)) => (m.clone(), None, true),
            _ => (primary.clone(), attach.as_ref(), false),
        };
        let pool = DbPool::connect_lazy(&target, attach_for_pool, settings.probe_timeout)?;

        let period = settings.failback_min_interval.max(Duration::from_secs(1));
        let quota = Quota::with_period(period)
            .ok_or_else(|| CastorError::Config("failback interval must be non-zero".into()))?;

        info!(
            role = %role,
            primary = %primary.redacted(),
            mirror = %mirror.as_ref().map_or_else(|| "<none>".to_string(), ConnectionTarget::redacted),
            "failover controller initialized"
        );
        if mirror.is_none() {
            info!("no mirror database configured; failover disabled");
        }

        Ok(Self {
            inner: Arc::new(ControllerInner {
                primary,
                mirror,
                attach,
                settings,
                active: RwLock::new(Arc::new(ActiveDatabase {
                    role,
                    target,
                    pool,
                    persisted,
                })),
                switch_lock: tokio::sync::Mutex::new(()),
                failback_limiter: RateLimiter::direct(quota),
                available: AtomicBool::new(true),
            }),
        })
    }

    /// Snapshot collaborators use to reach the active database.
    pub fn current(&self) -> Arc<ActiveDatabase> {
        self.inner
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn current_role(&self) -> Role {
        self.current().role
    }

    pub fn primary(&self) -> &ConnectionTarget {
        &self.inner.primary
    }

    pub fn mirror(&self) -> Option<&ConnectionTarget> {
        self.inner.mirror.as_ref()
    }

    pub fn attach_spec(&self) -> Option<&AttachSpec> {
        self.inner.attach.as_ref()
    }

    pub fn settings(&self) -> &FailoverSettings {
        &self.inner.settings
    }

    pub fn failover_enabled(&self) -> bool {
        self.inner.mirror.is_some()
    }

    /// Last-known availability of the active database, as seen by the monitor.
    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    fn set_available(&self, available: bool) {
        let was = self.inner.available.swap(available, Ordering::AcqRel);
        if was != available {
            if available {
                info!(role = %self.current_role(), "active database available");
            } else {
                warn!(role = %self.current_role(), "active database unavailable");
            }
        }
    }

    fn swap(&self, next: ActiveDatabase) -> Arc<ActiveDatabase> {
        let mut guard = self
            .inner
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(next))
    }

    fn retire(old: Arc<ActiveDatabase>) {
        // Waits for checked-out connections, so never on the caller's task.
        tokio::spawn(async move {
            old.pool.close().await;
            debug!(role = %old.role, "retired previous pool");
        });
    }

    pub async fn probe_active(&self) -> ProbeStatus {
        let active = self.current();
        probe(&active.target, self.inner.settings.probe_timeout).await
    }

    pub async fn switch_to_mirror(&self) -> Result<SwitchOutcome, CastorError> {
        let Some(mirror) = self.inner.mirror.as_ref() else {
            return Ok(SwitchOutcome::Unchanged);
        };
        let _guard = self.inner.switch_lock.lock().await;
        if self.current_role() == Role::Mirror {
            return Ok(SwitchOutcome::Unchanged);
        }

        let timeout = self.inner.settings.probe_timeout;
        if let ProbeStatus::Unhealthy(reason) = probe(mirror, timeout).await {
            error!(
                primary = %self.inner.primary.redacted(),
                mirror = %mirror.redacted(),
                reason = %reason,
                "mirror is unreachable; refusing to fail over"
            );
            return Err(CastorError::DualOutage {
                primary: self.inner.primary.redacted(),
                mirror: mirror.redacted(),
            });
        }

        let pool = DbPool::connect_lazy(mirror, None, timeout)?;
        let report = prepare::prepare_mirror(
            &pool,
            &self.inner.settings.subscriptions,
            &self.inner.settings.excluded_tables,
        )
        .await;

        let persisted = self.persist_marker(mirror).await;
        let old = self.swap(ActiveDatabase {
            role: Role::Mirror,
            target: mirror.clone(),
            pool,
            persisted,
        });
        Self::retire(old);
        self.set_available(true);

        warn!(
            from = %self.inner.primary.redacted(),
            to = %mirror.redacted(),
            "switched active database to mirror"
        );
        Ok(SwitchOutcome::Switched {
            prepare: Some(report),
        })
    }

    /// Readies the mirror for writes without switching to it.
    pub async fn prepare_mirror(&self) -> Result<PrepareReport, CastorError> {
        let mirror = self.inner.mirror.as_ref().ok_or(CastorError::FailoverDisabled)?;
        let active = self.current();
        if active.role == Role::Mirror {
            return Ok(prepare::prepare_mirror(
                &active.pool,
                &self.inner.settings.subscriptions,
                &self.inner.settings.excluded_tables,
            )
            .await);
        }

        let pool = DbPool::connect_lazy(mirror, None, self.inner.settings.probe_timeout)?;
        let report = prepare::prepare_mirror(
            &pool,
            &self.inner.settings.subscriptions,
            &self.inner.settings.excluded_tables,
        )
        .await;
        pool.close().await;
        Ok(report)
    }

    /// Rate-limited failback attempt. A limited call returns `false` without probing.
    pub async fn try_reconnect_primary(&self) -> bool {
        if self.current_role() == Role::Primary {
            return true;
        }
        if self.inner.failback_limiter.check().is_err() {
            debug!("failback attempt rate-limited");
            return false;
        }
        let status = probe(&self.inner.primary, self.inner.settings.probe_timeout).await;
        if !status.is_healthy() {
            debug!(reason = ?status.error(), "primary still unreachable");
            return false;
        }
        match self.switch_to_primary().await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "failback to primary failed");
                false
            }
        }
    }

    pub async fn switch_to_primary(&self) -> Result<SwitchOutcome, CastorError> {
        let _guard = self.inner.switch_lock.lock().await;
        if self.current_role() == Role::Primary {
            return Ok(SwitchOutcome::Unchanged);
        }

        let pool = DbPool::connect_lazy(
            &self.inner.primary,
            self.inner.attach.as_ref(),
            self.inner.settings.probe_timeout,
        )?;
        let old = self.swap(ActiveDatabase {
            role: Role::Primary,
            target: self.inner.primary.clone(),
            pool,
            persisted: false,
        });
        Self::retire(old);
        self.set_available(true);

        if let Some(path) = &self.inner.settings.marker_path
            && let Err(e) = marker::clear(path).await
        {
            warn!(path = %path.display(), error = %e, "failed to clear failover marker");
        }

        info!(primary = %self.inner.primary.redacted(), "switched active database back to primary");
        Ok(SwitchOutcome::Switched { prepare: None })
    }

    /// Operator failback: probes the primary (no rate limit) and switches when it answers.
    pub async fn failback(&self) -> Result<SwitchOutcome, CastorError> {
        if self.inner.mirror.is_none() {
            return Err(CastorError::FailoverDisabled);
        }
        if self.current_role() == Role::Primary {
            return Ok(SwitchOutcome::Unchanged);
        }
        try_probe(&self.inner.primary, self.inner.settings.probe_timeout).await?;
        self.switch_to_primary().await
    }

    /// One monitor step: probe the active database and apply the failover policy.
    ///
    /// Without a mirror the probe error is returned as is and the role never changes.
    pub async fn check_and_failover(&self) -> Result<Role, CastorError> {
        match self.current_role() {
            Role::Primary => {
                let Err(e) = self.probe_primary_with_retry().await else {
                    self.set_available(true);
                    return Ok(Role::Primary);
                };
                if self.inner.mirror.is_none() || !self.inner.settings.auto_failover {
                    self.set_available(false);
                    return Err(e);
                }
                warn!(error = %e, "primary unreachable; failing over to mirror");
                match self.switch_to_mirror().await {
                    Ok(_) => Ok(self.current_role()),
                    Err(e) => {
                        self.set_available(false);
                        Err(e)
                    }
                }
            }
            Role::Mirror => {
                if self.inner.settings.auto_failback && self.try_reconnect_primary().await {
                    return Ok(Role::Primary);
                }
                let Some(mirror) = self.inner.mirror.as_ref() else {
                    return Ok(Role::Mirror);
                };
                let timeout = self.inner.settings.probe_timeout;
                let Err(e) = try_probe(mirror, timeout).await else {
                    self.set_available(true);
                    return Ok(Role::Mirror);
                };

                warn!(error = %e, "mirror unreachable; trying primary");
                if try_probe(&self.inner.primary, timeout).await.is_ok() {
                    self.switch_to_primary().await?;
                    return Ok(Role::Primary);
                }
                self.set_available(false);
                error!(
                    primary = %self.inner.primary.redacted(),
                    mirror = %mirror.redacted(),
                    "primary and mirror are both unreachable"
                );
                Err(CastorError::DualOutage {
                    primary: self.inner.primary.redacted(),
                    mirror: mirror.redacted(),
                })
            }
        }
    }

    async fn probe_primary_with_retry(&self) -> Result<(), CastorError> {
        let timeout = self.inner.settings.probe_timeout;
        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.inner.settings.probe_retries)
            .with_jitter();

        (|| async { try_probe(&self.inner.primary, timeout).await })
            .retry(retry_policy)
            .when(|e: &CastorError| e.is_retryable())
            .notify(|err, dur: Duration| {
                warn!("primary probe retrying error {} with sleeping {:?}", err, dur);
            })
            .await
    }

    async fn persist_marker(&self, mirror: &ConnectionTarget) -> bool {
        let Some(path) = &self.inner.settings.marker_path else {
            return false;
        };
        match marker::store(path, &marker::FailoverMarker::for_mirror(mirror)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to persist failover marker");
                false
            }
        }
    }

    /// Role, persistence and a fresh probe of both targets.
    pub async fn status(&self) -> DatabaseStatusResponse {
        let active = self.current();
        let timeout = self.inner.settings.probe_timeout;

        let primary_probe = probe(&self.inner.primary, timeout);
        let mirror_probe = async {
            match &self.inner.mirror {
                Some(m) => Some(probe(m, timeout).await),
                None => None,
            }
        };
        let (primary_status, mirror_status) = futures::join!(primary_probe, mirror_probe);

        let target_info = |target: &ConnectionTarget, status: &ProbeStatus| TargetInfo {
            role: target.role(),
            connection: target.url_info(),
            healthy: status.is_healthy(),
            error: status.error().map(str::to_string),
        };

        DatabaseStatusResponse {
            current_database: active.role,
            primary_info: target_info(&self.inner.primary, &primary_status),
            mirror_info: self
                .inner
                .mirror
                .as_ref()
                .zip(mirror_status.as_ref())
                .map(|(m, s)| target_info(m, s)),
            using_mirror: active.role == Role::Mirror,
            persisted: active.persisted,
            timestamp: Utc::now(),
        }
    }
}
