//! Utility functions and helpers.

mod ids;
mod logging;
mod shutdown;

pub use ids::{ConnectionId, HandleId};
pub use logging::init_logging;
pub use shutdown::{ShutdownListener, ShutdownSignal};
