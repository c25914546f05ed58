use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Failover policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FailoverConfig {
    /// Let the health monitor switch to the mirror when the primary is unreachable.
    /// TOML: `failover.auto_failover`. Default: `true`.
    #[serde(default = "default_true")]
    pub auto_failover: bool,

    /// Let the health monitor switch back once the primary answers again.
    /// TOML: `failover.auto_failback`. Default: `false` (operator action via `POST /health/failback`).
    #[serde(default)]
    pub auto_failback: bool,

    /// Seconds between health monitor ticks.
    /// TOML: `failover.check_interval_secs`. Default: `30`.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Bound on one liveness probe (connect + `SELECT 1`), in seconds.
    /// TOML: `failover.probe_timeout_secs`. Default: `5`.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Probe attempts against the primary before declaring it down.
    /// TOML: `failover.probe_retries`. Default: `3`.
    #[serde(default = "default_probe_retries")]
    pub probe_retries: usize,

    /// Minimum seconds between two failback attempts.
    /// TOML: `failover.failback_min_interval_secs`. Default: `60`.
    #[serde(default = "default_failback_min_interval_secs")]
    pub failback_min_interval_secs: u64,

    /// File recording "currently on mirror" across restarts. Unset disables persistence.
    /// TOML: `failover.marker_path`. Default: unset.
    #[serde(default)]
    pub marker_path: Option<PathBuf>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            auto_failover: true,
            auto_failback: false,
            check_interval_secs: default_check_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_retries: default_probe_retries(),
            failback_min_interval_secs: default_failback_min_interval_secs(),
            marker_path: None,
        }
    }
}

impl FailoverConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn failback_min_interval(&self) -> Duration {
        Duration::from_secs(self.failback_min_interval_secs.max(1))
    }
}

fn default_true() -> bool {
    true
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_probe_retries() -> usize {
    3
}

fn default_failback_min_interval_secs() -> u64 {
    60
}
