//! dynhc - dynamic active health checking for upstream groups
//!
//! This crate probes the peers of load-balanced upstream groups and keeps
//! their up/down state current:
//! - TCP, HTTP and TLS hello probes with keep-alive connection reuse
//! - Fall/rise thresholds shared across worker threads
//! - Runtime option updates, host overrides and persisted snapshots
//! - Hot configuration reload
//! - Prometheus metrics

pub mod config;
pub mod health;
pub mod metrics;
pub mod probe;
pub mod state;
pub mod store;
pub mod upstream;
pub mod util;

pub use config::Config;
