//! Targets, their groups, and how clients are distributed among them.

pub mod algorithms;
pub mod dispatcher;
pub mod registry;
mod target;

pub use dispatcher::{DispatchEvent, Dispatcher, DispatcherHandle};
pub use registry::{AdminError, GroupSnapshot, TargetGroup, TargetRegistry};
pub use target::{Target, TargetSnapshot, REAP_INTERVAL};
