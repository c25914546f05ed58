pub mod health;
pub mod mirror;
