//! Routes each new client through the algorithm chain.
//!
//! The accept loop and the algorithms only ever hand clients and finished
//! connections to a `DispatcherHandle`, which never blocks. A single worker
//! task owns the per-client cursor into the chain.

use crate::backend::algorithms::AlgorithmChain;
use crate::metrics::MetricsCollector;
use crate::proxy::{Client, Connection};
use crate::util::{HandleId, ShutdownListener};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Work queued for the dispatcher.
pub enum DispatchEvent {
    /// A new client, or one an algorithm could not place.
    Unconnected(Client),
    /// A client that an algorithm connected to a target.
    Finished(Connection),
    /// A client an algorithm had to close.
    Abandoned(HandleId),
}

/// Cheap, cloneable entry point into the dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    events: mpsc::UnboundedSender<DispatchEvent>,
    in_flight: Arc<AtomicUsize>,
}

impl DispatcherHandle {
    /// Queue a client for its next placement attempt.
    pub fn offer_unconnected(&self, client: Client) {
        if let Err(mpsc::error::SendError(DispatchEvent::Unconnected(client))) =
            self.events.send(DispatchEvent::Unconnected(client))
        {
            debug!(client = %client.peer(), "dispatcher stopped, closing client");
            client.close();
        }
    }

    /// Queue a connection that an algorithm finished setting up.
    pub fn offer_finished(&self, connection: Connection) {
        if let Err(mpsc::error::SendError(DispatchEvent::Finished(connection))) =
            self.events.send(DispatchEvent::Finished(connection))
        {
            connection.terminate();
        }
    }

    /// Forget a client that was closed while an algorithm held it.
    pub fn offer_abandoned(&self, client: HandleId) {
        let _ = self.events.send(DispatchEvent::Abandoned(client));
    }

    /// Clients currently somewhere in the algorithm chain.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// The worker side. Create with `Dispatcher::new`, then `run` it.
pub struct Dispatcher {
    chain: AlgorithmChain,
    events: mpsc::UnboundedReceiver<DispatchEvent>,
    /// Index of the algorithm each client tried last.
    cursors: HashMap<HandleId, usize>,
    in_flight: Arc<AtomicUsize>,
    metrics: MetricsCollector,
}

impl Dispatcher {
    pub fn new(chain: AlgorithmChain, metrics: MetricsCollector) -> (Self, DispatcherHandle) {
        let (handle, events) = Self::channel();
        let dispatcher = Self {
            chain,
            events,
            cursors: HashMap::new(),
            in_flight: Arc::clone(&handle.in_flight),
            metrics,
        };
        (dispatcher, handle)
    }

    /// A bare handle and the receiving end of its queue.
    pub(crate) fn channel() -> (DispatcherHandle, mpsc::UnboundedReceiver<DispatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = DispatcherHandle {
            events: tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        };
        (handle, rx)
    }

    /// Process events until shutdown.
    pub async fn run(mut self, mut shutdown: ShutdownListener) {
        info!(algorithms = self.chain.len(), "dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }

        info!("dispatcher stopped");
    }

    fn handle(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::Unconnected(client) => self.dispatch(client),
            DispatchEvent::Finished(connection) => self.finish(connection),
            DispatchEvent::Abandoned(id) => {
                if self.cursors.remove(&id).is_some() {
                    trace!(client = %id, "client abandoned by algorithm");
                    self.metrics.record_client_abandoned();
                }
            }
        }
        self.in_flight.store(self.cursors.len(), Ordering::Relaxed);
    }

    /// Hand `client` to the next algorithm in the chain, or give up.
    fn dispatch(&mut self, client: Client) {
        let id = client.id();
        let index = match self.cursors.get(&id) {
            Some(previous) => previous + 1,
            None => 0,
        };

        let Some(algorithm) = self.chain.get(index) else {
            debug!(client = %client.peer(), tried = index, "no algorithm could place client");
            self.cursors.remove(&id);
            self.metrics.record_client_abandoned();
            client.close();
            return;
        };

        trace!(client = %client.peer(), algorithm = algorithm.name(), "offering client");
        self.cursors.insert(id, index);
        algorithm.try_to_connect(client);
    }

    fn finish(&mut self, connection: Connection) {
        for algorithm in self.chain.load().iter() {
            algorithm.connection_notify(&connection);
        }
        self.cursors.remove(&connection.client().id());

        match connection.target() {
            Some(target) => target.add_connection(connection),
            None => {
                debug!(connection = %connection, "target removed before hand-off");
                connection.terminate();
            }
        }
    }
}
