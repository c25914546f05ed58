use super::FailoverController;
use crate::error::CastorError;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// On-demand checks closer together than this are coalesced.
const MIN_CHECK_SPACING: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum HealthMonitorMessage {
    /// Periodic check from the interval task.
    Tick,
    /// Check requested by the request gate after a failed probe.
    CheckNow,
}

#[derive(Clone)]
pub struct HealthMonitorHandle {
    actor: ActorRef<HealthMonitorMessage>,
    /// Actor task; taken by the first [`HealthMonitorHandle::shutdown`].
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl HealthMonitorHandle {
    pub fn check_now(&self) -> Result<(), CastorError> {
        ractor::cast!(self.actor, HealthMonitorMessage::CheckNow)
            .map_err(|e| CastorError::RactorError(format!("HealthMonitor CheckNow failed: {e}")))
    }

    /// Stops the actor and waits for its task to finish.
    pub async fn shutdown(&self) {
        self.actor.stop(None);
        let join = self.join.lock().ok().and_then(|mut slot| slot.take());
        if let Some(join) = join
            && let Err(e) = join.await
        {
            warn!(error = %e, "HealthMonitor task ended abnormally");
        }
    }
}

struct HealthMonitorState {
    controller: FailoverController,
    last_check: Option<Instant>,
    ticker: JoinHandle<()>,
}

struct HealthMonitor;

#[ractor::async_trait]
impl Actor for HealthMonitor {
    type Msg = HealthMonitorMessage;
    type State = HealthMonitorState;
    type Arguments = (FailoverController, Duration);

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        (controller, interval): Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let ticker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if ractor::cast!(myself, HealthMonitorMessage::Tick).is_err() {
                    break;
                }
            }
        });

        info!(interval_secs = interval.as_secs(), "HealthMonitor started");
        Ok(HealthMonitorState {
            controller,
            last_check: None,
            ticker,
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.ticker.abort();
        debug!("HealthMonitor stopped");
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if matches!(message, HealthMonitorMessage::CheckNow)
            && state
                .last_check
                .is_some_and(|at| at.elapsed() < MIN_CHECK_SPACING)
        {
            debug!("coalescing on-demand health check");
            return Ok(());
        }

        let before = state.controller.current_role();
        let result = state.controller.check_and_failover().await;
        state.last_check = Some(Instant::now());

        match result {
            Ok(after) if after != before => {
                info!(from = %before, to = %after, "active database changed");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(role = %state.controller.current_role(), error = %e, "health check failed");
            }
        }
        Ok(())
    }
}

/// Starts the monitor. The first check runs immediately.
pub async fn spawn(
    controller: FailoverController,
    interval: Duration,
) -> Result<HealthMonitorHandle, CastorError> {
    let (actor, join) = Actor::spawn(None, HealthMonitor, (controller, interval))
        .await
        .map_err(|e| CastorError::RactorError(format!("failed to spawn HealthMonitor: {e}")))?;
    Ok(HealthMonitorHandle {
        actor,
        join: Arc::new(Mutex::new(Some(join))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::FailoverSettings;

    #[tokio::test]
    async fn shutdown_waits_for_the_actor() {
        let controller = FailoverController::initialize(
            "sqlite::memory:",
            None,
            None,
            FailoverSettings::default(),
        )
        .unwrap();
        let monitor = spawn(controller, Duration::from_secs(3600)).await.unwrap();
        monitor.check_now().unwrap();

        let other = monitor.clone();
        monitor.shutdown().await;
        assert!(monitor.join.lock().unwrap().is_none());
        assert!(other.check_now().is_err());
        // A second shutdown has nothing left to wait for.
        other.shutdown().await;
    }
}
