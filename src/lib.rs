//! tcplb - a TCP load balancer
//!
//! Clients accepted on the listen socket are passed through an ordered chain
//! of distribution algorithms until one of them connects the client to a
//! target. Each target then relays bytes between its client/backend pairs
//! on a single non-blocking engine.
//!
//! - Round-robin and sticky (per client address) distribution
//! - Ordered failover groups of targets
//! - Automatic disabling after repeated connect failures
//! - TCP, HTTP and script health checks
//! - An administrative console and Prometheus metrics

pub mod admin;
pub mod backend;
pub mod balancer;
pub mod config;
pub mod frontend;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod util;

pub use balancer::Balancer;
pub use config::Config;
