pub mod health;
pub mod mirror;
pub mod role;

pub use health::{
    DatabaseStatusResponse, FailoverResponse, HealthResponse, HealthStatus, PrepareReport,
    SequenceReset, TargetInfo, UrlInfo,
};
pub use mirror::{
    MirrorSetupRequest, MirrorSetupResponse, MirrorStatusResponse, MirrorTablesResponse,
    TableError, TablePreview,
};
pub use role::{Dialect, MirrorMode, Role};
