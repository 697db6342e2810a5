//! Health checking.
//!
//! A [`HealthChecker`] periodically runs a [`HealthProbe`] against every
//! target and enables or disables it accordingly.

mod checker;
mod probe;

pub use checker::HealthChecker;
pub use probe::{build_probe, HealthProbe, HttpProbe, ProbeError, ScriptProbe, TcpProbe};
