//! A backend server and everything the balancer knows about it.

use crate::backend::algorithms::AlgorithmChain;
use crate::config::TargetSettings;
use crate::proxy::{Connection, RelayHandle, RelaySnapshot, RelayStats};
use crate::util::ConnectionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How often terminated connections are evicted from a target.
pub const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// A backend server.
///
/// Owns its live connections and the relay engine that moves their bytes.
/// Algorithms only start new connections to a target while it is enabled.
pub struct Target {
    address: SocketAddr,
    settings: TargetSettings,
    state: Mutex<TargetState>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    total_connections: AtomicU64,
    relay: RelayHandle,
}

#[derive(Debug)]
struct TargetState {
    enabled: bool,
    failure_count: u32,
    /// Taken out of the registry. Never enabled again.
    removed: bool,
}

/// Point-in-time view of a target for the console and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSnapshot {
    pub address: SocketAddr,
    pub enabled: bool,
    pub failure_count: u32,
    pub active_connections: usize,
    pub total_connections: u64,
    pub bytes_client_to_server: u64,
    pub bytes_server_to_client: u64,
}

impl Target {
    /// Create an enabled target and start its relay engine and reaper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(address: SocketAddr, settings: TargetSettings, chain: AlgorithmChain) -> Arc<Self> {
        let target = Arc::new(Self {
            address,
            settings,
            state: Mutex::new(TargetState {
                enabled: true,
                failure_count: 0,
                removed: false,
            }),
            connections: Mutex::new(HashMap::new()),
            total_connections: AtomicU64::new(0),
            relay: RelayHandle::spawn(address, chain, settings.half_close),
        });

        tokio::spawn(reap(Arc::downgrade(&target)));
        debug!(target = %address, "target created");
        target
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Make the target eligible again and forget past failures.
    pub fn enable(&self) {
        let was_enabled = {
            let mut state = self.state.lock();
            if state.removed {
                return;
            }
            let was_enabled = state.enabled;
            state.enabled = true;
            state.failure_count = 0;
            was_enabled
        };
        if !was_enabled {
            info!(target = %self.address, "target enabled");
        }
    }

    /// Stop sending new clients here. Idempotent.
    ///
    /// With `terminate_on_disable` set, every live connection is closed.
    pub fn disable(&self) {
        {
            let mut state = self.state.lock();
            if !state.enabled {
                return;
            }
            state.enabled = false;
        }

        warn!(target = %self.address, "target disabled");
        if self.settings.terminate_on_disable {
            self.terminate_all();
        }
    }

    /// Called once the registry has dropped this target: disable it for
    /// good and terminate every connection, including ones whose connect
    /// was still in flight when it was removed.
    pub fn retire(&self) {
        {
            let mut state = self.state.lock();
            state.removed = true;
            state.enabled = false;
        }
        self.terminate_all();
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Record a failed connect; disables the target once the count exceeds
    /// the configured limit.
    pub fn increment_failure_count(&self) {
        let should_disable = {
            let mut state = self.state.lock();
            state.failure_count = state.failure_count.saturating_add(1);
            debug!(
                target = %self.address,
                failures = state.failure_count,
                limit = self.settings.failure_count_limit,
                "connect failure recorded"
            );
            state.enabled && state.failure_count > self.settings.failure_count_limit
        };
        if should_disable {
            warn!(target = %self.address, "failure limit exceeded");
            self.disable();
        }
    }

    pub fn reset_failure_count(&self) {
        self.state.lock().failure_count = 0;
    }

    /// Take ownership of a freshly established connection and start
    /// relaying it.
    pub fn add_connection(&self, connection: Connection) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        {
            // Holding the state lock orders this against `disable` and
            // `retire`, so a connection is either rejected here or
            // terminated there.
            let state = self.state.lock();
            if state.removed || (!state.enabled && self.settings.terminate_on_disable) {
                drop(state);
                debug!(target = %self.address, connection = %connection, "target unavailable, dropping connection");
                connection.terminate();
                return;
            }
            self.connections.lock().insert(connection.id(), connection.clone());
        }

        if !self.relay.register(connection.clone()) {
            warn!(target = %self.address, "relay engine stopped, dropping connection");
            connection.terminate();
            self.connections.lock().remove(&connection.id());
        }
    }

    /// Close every live connection and stop tracking them.
    pub fn terminate_all(&self) {
        let drained: Vec<Connection> = self.connections.lock().drain().map(|(_, c)| c).collect();
        if !drained.is_empty() {
            info!(target = %self.address, count = drained.len(), "terminating connections");
        }
        for connection in drained {
            connection.terminate();
        }
    }

    /// Evict connections that have terminated. Returns how many were removed.
    pub fn reap(&self) -> usize {
        let mut connections = self.connections.lock();
        let before = connections.len();
        connections.retain(|_, c| !c.is_terminated());
        before - connections.len()
    }

    /// Connections currently tracked, including ones not yet reaped.
    pub fn active_connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.connections.lock().values().cloned().collect()
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &RelayStats {
        self.relay.stats()
    }

    /// Table sizes of this target's relay engine.
    pub async fn relay_snapshot(&self) -> Option<RelaySnapshot> {
        self.relay.snapshot().await
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        let (enabled, failure_count) = {
            let state = self.state.lock();
            (state.enabled, state.failure_count)
        };
        TargetSnapshot {
            address: self.address,
            enabled,
            failure_count,
            active_connections: self.active_connections(),
            total_connections: self.total_connections(),
            bytes_client_to_server: self.stats().client_to_server(),
            bytes_server_to_client: self.stats().server_to_client(),
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("address", &self.address)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Periodically evict terminated connections until the target is dropped.
async fn reap(target: Weak<Target>) {
    let mut ticker = interval_at(Instant::now() + REAP_INTERVAL, REAP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(target) = target.upgrade() else {
            break;
        };
        let reaped = target.reap();
        if reaped > 0 {
            debug!(target = %target.address, reaped, "reaped terminated connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Client;
    use tokio::net::{TcpListener, TcpStream};

    fn settings(limit: u32, terminate_on_disable: bool) -> TargetSettings {
        TargetSettings {
            failure_count_limit: limit,
            terminate_on_disable,
            half_close: false,
        }
    }

    /// Build a connection whose both ends terminate on loopback sockets we
    /// keep alive for the duration of the test.
    async fn loopback_connection(target: &Arc<Target>) -> (Connection, TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client_side, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server_side, accepted_server) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let client = Client::new(accepted.unwrap().0).unwrap();
        let connection = Connection::new(client, server_side.unwrap(), target).unwrap();
        (connection, client_side.unwrap(), accepted_server.unwrap().0)
    }

    #[tokio::test]
    async fn test_failure_limit_disables() {
        let target = Target::new("127.0.0.1:9".parse().unwrap(), settings(2, false), AlgorithmChain::default());

        target.increment_failure_count();
        target.increment_failure_count();
        assert!(target.is_enabled(), "count equal to limit must not disable");

        target.increment_failure_count();
        assert!(!target.is_enabled());
        assert_eq!(target.failure_count(), 3);
    }

    #[tokio::test]
    async fn test_enable_resets_failures() {
        let target = Target::new("127.0.0.1:9".parse().unwrap(), settings(0, false), AlgorithmChain::default());
        target.increment_failure_count();
        assert!(!target.is_enabled());

        target.enable();
        assert!(target.is_enabled());
        assert_eq!(target.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_failure_count() {
        let limit = 3;
        let target = Target::new("127.0.0.1:9".parse().unwrap(), settings(limit, false), AlgorithmChain::default());
        for _ in 0..limit {
            target.increment_failure_count();
        }
        target.reset_failure_count();
        assert_eq!(target.failure_count(), 0);

        // One reset buys a fresh run of `limit` failures.
        for _ in 0..limit {
            target.increment_failure_count();
        }
        assert!(target.is_enabled());

        target.increment_failure_count();
        assert!(!target.is_enabled());
    }

    #[tokio::test]
    async fn test_disable_terminates_connections() {
        let target = Target::new("127.0.0.1:9".parse().unwrap(), settings(5, true), AlgorithmChain::default());
        let (connection, _client, _server) = loopback_connection(&target).await;

        target.add_connection(connection.clone());
        assert_eq!(target.active_connections(), 1);

        target.disable();
        target.disable();
        assert_eq!(target.active_connections(), 0);
        assert!(connection.is_terminated());
    }

    #[tokio::test]
    async fn test_disable_keeps_connections_by_default() {
        let target = Target::new("127.0.0.1:9".parse().unwrap(), settings(5, false), AlgorithmChain::default());
        let (connection, _client, _server) = loopback_connection(&target).await;

        target.add_connection(connection.clone());
        target.disable();
        assert_eq!(target.active_connections(), 1);
        assert!(!connection.is_terminated());
    }

    #[tokio::test]
    async fn test_add_to_disabled_target_terminates() {
        let target = Target::new("127.0.0.1:9".parse().unwrap(), settings(5, true), AlgorithmChain::default());
        target.disable();

        let (connection, _client, _server) = loopback_connection(&target).await;
        target.add_connection(connection.clone());

        assert!(connection.is_terminated());
        assert_eq!(target.active_connections(), 0);
        assert_eq!(target.total_connections(), 1);
    }

    #[tokio::test]
    async fn test_retired_target_rejects_late_connection() {
        let target = Target::new("127.0.0.1:9".parse().unwrap(), settings(5, false), AlgorithmChain::default());
        let (existing, _c1, _s1) = loopback_connection(&target).await;
        target.add_connection(existing.clone());

        target.retire();
        assert!(existing.is_terminated());
        assert!(target.is_removed());

        let (late, _c2, _s2) = loopback_connection(&target).await;
        target.add_connection(late.clone());
        assert!(late.is_terminated());
        assert_eq!(target.active_connections(), 0);

        target.enable();
        assert!(!target.is_enabled());
    }

    #[tokio::test]
    async fn test_reap_removes_terminated() {
        let target = Target::new("127.0.0.1:9".parse().unwrap(), settings(5, false), AlgorithmChain::default());
        let (first, _c1, _s1) = loopback_connection(&target).await;
        let (second, _c2, _s2) = loopback_connection(&target).await;

        target.add_connection(first.clone());
        target.add_connection(second);
        first.terminate();

        assert_eq!(target.reap(), 1);
        assert_eq!(target.active_connections(), 1);
    }
}
