//! Metrics collection and exposition.

mod collector;
mod server;

pub use collector::{HealthCheckResult, MetricsCollector};
pub use server::MetricsServer;
