//! Process-unique identifiers for sockets and connections.
//!
//! Sockets move between tasks (acceptor, dispatcher, algorithms, relay
//! engines), so every component keys its tables by these small copyable ids
//! instead of by the socket itself.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter shared by every id kind so ids never collide across kinds in logs.
static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Identifies one socket (either side of a proxied connection).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Allocate a new handle id.
    pub fn next() -> Self {
        Self(next_id())
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h-{:x}", self.0)
    }
}

/// Identifies one client↔backend connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a new connection id.
    pub fn next() -> Self {
        Self(next_id())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{:x}", self.0)
    }
}
