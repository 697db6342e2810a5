//! Client↔backend connections and the per-target relay engine.

mod connection;
mod delayed;
mod relay;

pub use connection::{Client, Connection, Endpoint};
pub use relay::{Direction, RelayHandle, RelaySnapshot, RelayStats, BUFFER_SIZE};
