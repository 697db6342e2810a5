//! Distribution algorithms.
//!
//! Each algorithm gets a shot at every new client, in configured order. An
//! algorithm either connects the client to a target and reports the
//! finished connection to the dispatcher, or hands the client back so the
//! next algorithm can try.

mod connector;
mod round_robin;
mod sticky_hash;

pub use connector::{ConnectHandler, ConnectOutcome, Connector, PendingConnection};
pub use round_robin::RoundRobin;
pub use sticky_hash::StickyHash;

use crate::backend::dispatcher::DispatcherHandle;
use crate::backend::registry::TargetRegistry;
use crate::config::AlgorithmConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{Client, Connection, Endpoint};
use crate::util::ShutdownSignal;
use arc_swap::{ArcSwap, Guard};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// A strategy for picking a target for a client.
pub trait DistributionAlgorithm: Send + Sync {
    /// Name used in logs and the administrative console.
    fn name(&self) -> &'static str;

    /// Start connecting `client` somewhere.
    ///
    /// Must not block: the outbound connect happens in the background, and
    /// the client ends up either in a finished connection or back at the
    /// dispatcher.
    fn try_to_connect(&self, client: Client);

    /// Called for every finished connection, whichever algorithm made it.
    fn connection_notify(&self, _connection: &Connection) {}

    /// Inspect or replace bytes flowing from client to backend.
    ///
    /// Runs on the target's relay task, so it must be quick. Returning an
    /// empty buffer drops the chunk.
    fn review_client_to_server(&self, _client: &Endpoint, _server: &Endpoint, data: Bytes) -> Bytes {
        data
    }

    /// Inspect or replace bytes flowing from backend to client.
    fn review_server_to_client(&self, _client: &Endpoint, _server: &Endpoint, data: Bytes) -> Bytes {
        data
    }

    /// Sizes of internal tables, as `(name, entries)`.
    fn table_sizes(&self) -> Vec<(&'static str, usize)>;

    /// Spawn the algorithm's background tasks.
    fn start(self: Arc<Self>, shutdown: &ShutdownSignal);
}

/// The ordered, shared list of configured algorithms.
///
/// Targets need the chain (for the relay's review hooks) before the
/// algorithms exist, since the algorithms need the targets. The chain is
/// created empty, handed to every target, and filled with `set` once the
/// algorithms are built.
#[derive(Clone)]
pub struct AlgorithmChain {
    inner: Arc<ArcSwap<Vec<Arc<dyn DistributionAlgorithm>>>>,
}

impl AlgorithmChain {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(Vec::new())),
        }
    }

    pub fn set(&self, algorithms: Vec<Arc<dyn DistributionAlgorithm>>) {
        self.inner.store(Arc::new(algorithms));
    }

    pub fn load(&self) -> Guard<Arc<Vec<Arc<dyn DistributionAlgorithm>>>> {
        self.inner.load()
    }

    /// The algorithm at `index` in the chain.
    pub fn get(&self, index: usize) -> Option<Arc<dyn DistributionAlgorithm>> {
        self.inner.load().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AlgorithmChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything an algorithm needs from the rest of the balancer.
#[derive(Clone)]
pub struct AlgorithmContext {
    pub registry: Arc<TargetRegistry>,
    pub dispatcher: DispatcherHandle,
    pub connect_timeout: Duration,
    pub metrics: MetricsCollector,
}

/// Build an algorithm from its configuration.
pub fn build_algorithm(config: &AlgorithmConfig, ctx: &AlgorithmContext) -> Arc<dyn DistributionAlgorithm> {
    match config {
        AlgorithmConfig::RoundRobin => Arc::new(RoundRobin::new(ctx.clone())),
        AlgorithmConfig::StickyHash { sticky_timeout } => Arc::new(StickyHash::new(ctx.clone(), *sticky_timeout)),
    }
}
