//! Database plumbing shared by the mirror and failover layers.
//!
//! Layout:
//! - `ident.rs`: identifier allow-list and quoting
//! - `target.rs`: DSN descriptors, redaction, sanitized URL info
//! - `pool.rs`: dialect-tagged sqlx pools
//! - `introspect.rs`: table/column/primary-key listing
//! - `value.rs`: row to JSON conversion
//! - `probe.rs`: bounded liveness checks

pub mod ident;
pub mod introspect;
pub mod pool;
pub mod probe;
pub mod target;
pub mod value;

pub use ident::{Ident, validate_type_name};
pub use introspect::{ColumnInfo, MirrorTableSpec, TableInfo};
pub use pool::{AttachSpec, DbPool};
pub use probe::{ProbeStatus, probe, try_probe};
pub use target::{ConnectionTarget, redact_dsn};
