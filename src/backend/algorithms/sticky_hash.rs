//! Sticky distribution by client address.
//!
//! Remembers which target each client IP was last connected to (by any
//! algorithm) and sends repeat clients back there. Clients without a usable
//! mapping are handed back to the dispatcher so a later algorithm can place
//! them. Mappings idle for longer than the sticky timeout are forgotten.

use super::connector::{ConnectHandler, Connector};
use super::{AlgorithmContext, DistributionAlgorithm};
use crate::backend::Target;
use crate::proxy::{Client, Connection};
use crate::util::{HandleId, ShutdownSignal};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

/// Bounds on the time between sweeps of idle mappings.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

pub struct StickyHash {
    ctx: AlgorithmContext,
    connector: Arc<Connector>,
    sticky_timeout: Duration,
    mappings: DashMap<IpAddr, Mapping>,
}

struct Mapping {
    target: Weak<Target>,
    last_used: Instant,
}

impl StickyHash {
    pub fn new(ctx: AlgorithmContext, sticky_timeout: Duration) -> Self {
        let connector = Arc::new(Connector::new("sticky_hash", ctx.connect_timeout, ctx.metrics.clone()));
        Self {
            ctx,
            connector,
            sticky_timeout,
            mappings: DashMap::new(),
        }
    }

    /// The target `ip` is mapped to, if it still exists.
    pub fn lookup(&self, ip: IpAddr) -> Option<Arc<Target>> {
        let target = self.mappings.get(&ip)?.target.upgrade();
        if target.is_none() {
            self.mappings.remove(&ip);
        }
        target
    }

    /// Map `ip` to `target`, refreshing its idle timer.
    pub fn record(&self, ip: IpAddr, target: &Arc<Target>) {
        self.mappings.insert(
            ip,
            Mapping {
                target: Arc::downgrade(target),
                last_used: Instant::now(),
            },
        );
    }

    /// Forget mappings last used before `cutoff`. Returns how many went.
    pub fn purge_older_than(&self, cutoff: Instant) -> usize {
        let before = self.mappings.len();
        self.mappings
            .retain(|_, mapping| mapping.last_used >= cutoff && mapping.target.strong_count() > 0);
        before.saturating_sub(self.mappings.len())
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    fn sweep_interval(&self) -> Duration {
        (self.sticky_timeout / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
    }

    fn sweep(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.sticky_timeout) else {
            return;
        };
        let purged = self.purge_older_than(cutoff);
        if purged > 0 {
            debug!(purged, remaining = self.mapping_count(), "expired sticky mappings");
        }
    }
}

impl DistributionAlgorithm for StickyHash {
    fn name(&self) -> &'static str {
        "sticky_hash"
    }

    fn try_to_connect(&self, client: Client) {
        let ip = client.peer().ip();
        match self.lookup(ip) {
            Some(target) if target.is_enabled() => {
                trace!(client = %client.peer(), target = %target.address(), "using sticky mapping");
                self.connector.initiate_connection(client, target);
            }
            Some(target) => {
                trace!(client = %client.peer(), target = %target.address(), "sticky target disabled");
                self.ctx.dispatcher.offer_unconnected(client);
            }
            None => {
                trace!(client = %client.peer(), "no sticky mapping");
                self.ctx.dispatcher.offer_unconnected(client);
            }
        }
    }

    fn connection_notify(&self, connection: &Connection) {
        if let Some(target) = connection.target() {
            self.record(connection.client().peer().ip(), &target);
        }
    }

    fn table_sizes(&self) -> Vec<(&'static str, usize)> {
        vec![
            ("mappings", self.mapping_count()),
            ("pending_connections", self.connector.pending_count()),
            ("failed_connections", self.connector.failed_count()),
        ]
    }

    fn start(self: Arc<Self>, shutdown: &ShutdownSignal) {
        let sticky = Arc::clone(&self);
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(sticky.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = ticker.tick() => sticky.sweep(),
                }
            }
        });

        let connector = Arc::clone(&self.connector);
        connector.start(self, shutdown);
    }
}

impl ConnectHandler for StickyHash {
    fn on_connected(&self, connection: Connection) {
        self.ctx.dispatcher.offer_finished(connection);
    }

    fn on_failed(&self, client: Client, _target: Arc<Target>) {
        self.ctx.dispatcher.offer_unconnected(client);
    }

    fn on_abandoned(&self, client: HandleId) {
        self.ctx.dispatcher.offer_abandoned(client);
    }
}
