//! Primary/mirror failover.
//!
//! - `controller.rs`: active-role state machine and switch operations
//! - `prepare.rs`: subscription teardown and sequence resync on promotion
//! - `marker.rs`: optional on-disk "running on mirror" record
//! - `monitor.rs`: background actor driving automatic transitions

pub mod controller;
pub mod marker;
pub mod monitor;
pub mod prepare;

pub use controller::{ActiveDatabase, FailoverController, FailoverSettings, SwitchOutcome};
pub use monitor::{HealthMonitorHandle, HealthMonitorMessage};
