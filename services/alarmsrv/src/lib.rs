//! Alarm Service (AlarmSrv)
//!
//! Standalone alarm rule executor: consumes alarm rules records from Redis
//! partition lists, evaluates them with the `voltage-alarm` engine, persists
//! per-entity progress in Redis hashes and publishes alarm events on a
//! Redis channel.

pub mod app;
pub mod catalog_file;
pub mod config;
pub mod logging;
pub mod redis;
pub mod shutdown;

pub const SERVICE_NAME: &str = "alarmsrv";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
