pub mod config;
pub mod db;
pub mod error;
pub mod failover;
pub mod mirror;
pub mod server;

pub use error::CastorError;
pub use failover::FailoverController;
pub use mirror::MirrorService;
