//! Metrics collection and exposition.

mod collector;
mod server;

pub use collector::{ConnectResult, MetricsCollector};
pub use server::MetricsServer;
