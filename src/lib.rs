pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod funding;
pub mod ledger;
pub mod middleware;
pub mod server;
pub mod settlement;
pub mod telemetry;

pub use crate::config::Config;
pub use crate::error::{AppError, AppResult};
