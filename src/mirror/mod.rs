//! Mirror provisioning, inspection and read access.

pub mod mode;
pub mod postgres;
pub mod preview;
pub mod provisioner;
pub mod sqlite;

pub use preview::{DEFAULT_PREVIEW_LIMIT, MAX_PREVIEW_LIMIT, parse_limit};
pub use provisioner::MirrorService;
