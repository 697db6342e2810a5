//! Per-target data relay engine.
//!
//! Every target owns one relay task. It multiplexes all client↔backend
//! socket pairs of that target: waits for read readiness, reads up to
//! `BUFFER_SIZE` bytes, passes them through the algorithm chain's review
//! hooks and writes them to the opposite socket. A destination that cannot
//! keep up has its backlog handed to the delayed writer, and the source
//! stops being read until that backlog drains.

use crate::backend::algorithms::AlgorithmChain;
use crate::proxy::connection::{Connection, Endpoint};
use crate::proxy::delayed::{spawn_delayed_writer, DelayedCommand, PendingWrite};
use crate::util::HandleId;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Size of the read buffer shared by every pair on a target.
pub const BUFFER_SIZE: usize = 128 * 1024;

/// Reads from one source per readiness event before yielding to the others.
const MAX_READS_PER_WAKE: usize = 64;

/// Which way bytes are flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client_to_server",
            Direction::ServerToClient => "server_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte counters for one target, counted as data is read from the source.
#[derive(Debug, Default)]
pub struct RelayStats {
    client_to_server: AtomicU64,
    server_to_client: AtomicU64,
}

impl RelayStats {
    fn record(&self, direction: Direction, bytes: usize) {
        let counter = match direction {
            Direction::ClientToServer => &self.client_to_server,
            Direction::ServerToClient => &self.server_to_client,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn client_to_server(&self) -> u64 {
        self.client_to_server.load(Ordering::Relaxed)
    }

    pub fn server_to_client(&self) -> u64 {
        self.server_to_client.load(Ordering::Relaxed)
    }
}

/// Sizes of the relay engine's internal tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySnapshot {
    /// Socket pairs being relayed.
    pub pairs: usize,
    /// Sockets currently being watched for reads.
    pub watched: usize,
    /// Sources whose reads are suspended behind a delayed write.
    pub suspended: usize,
}

pub(crate) enum RelayCommand {
    Register(Connection),
    Reactivate(HandleId),
    Close(HandleId),
    Snapshot(oneshot::Sender<RelaySnapshot>),
}

/// Handle used by a target to feed its relay engine.
///
/// Dropping every handle stops the engine, which terminates whatever
/// connections it was still relaying.
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<RelayCommand>,
    stats: Arc<RelayStats>,
}

impl RelayHandle {
    /// Start the relay engine and its delayed writer for `target`.
    pub fn spawn(target: SocketAddr, chain: AlgorithmChain, half_close: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(RelayStats::default());
        let delayed = spawn_delayed_writer(target, tx.downgrade());

        let engine = RelayEngine {
            target,
            half_close,
            chain,
            stats: Arc::clone(&stats),
            commands: rx,
            delayed,
            pairs: HashMap::new(),
            clients: HashMap::new(),
            servers: HashMap::new(),
            suspended: HashSet::new(),
            armed: HashSet::new(),
            readable: FuturesUnordered::new(),
            buffer: vec![0u8; BUFFER_SIZE],
        };
        tokio::spawn(engine.run());

        Self {
            commands: tx,
            stats,
        }
    }

    /// Start relaying a connection. Returns false if the engine is gone.
    pub fn register(&self, connection: Connection) -> bool {
        self.commands.send(RelayCommand::Register(connection)).is_ok()
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// Ask the engine for the sizes of its tables.
    pub async fn snapshot(&self) -> Option<RelaySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(RelayCommand::Snapshot(tx)).ok()?;
        rx.await.ok()
    }
}

type Readable = BoxFuture<'static, (HandleId, io::Result<()>)>;

struct RelayEngine {
    target: SocketAddr,
    half_close: bool,
    chain: AlgorithmChain,
    stats: Arc<RelayStats>,
    commands: mpsc::UnboundedReceiver<RelayCommand>,
    delayed: mpsc::UnboundedSender<DelayedCommand>,
    /// Keyed by the client handle.
    pairs: HashMap<HandleId, Connection>,
    /// client handle → server handle
    clients: HashMap<HandleId, HandleId>,
    /// server handle → client handle
    servers: HashMap<HandleId, HandleId>,
    suspended: HashSet<HandleId>,
    /// Handles with a readiness future in flight.
    armed: HashSet<HandleId>,
    readable: FuturesUnordered<Readable>,
    buffer: Vec<u8>,
}

enum Event {
    Command(RelayCommand),
    Readable(HandleId, io::Result<()>),
}

/// Resolved view of one side of a pair.
struct Route {
    src: Arc<Endpoint>,
    dst: Arc<Endpoint>,
    direction: Direction,
    connection: Connection,
}

impl RelayEngine {
    async fn run(mut self) {
        debug!(target = %self.target, "relay engine started");

        loop {
            let event = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => break,
                },
                Some((id, result)) = self.readable.next(), if !self.readable.is_empty() => {
                    Event::Readable(id, result)
                }
            };

            match event {
                Event::Command(RelayCommand::Register(connection)) => self.register(connection),
                Event::Command(RelayCommand::Reactivate(src)) => {
                    if self.suspended.remove(&src) {
                        trace!(target = %self.target, handle = %src, "resuming reads");
                        self.arm(src);
                    }
                }
                Event::Command(RelayCommand::Close(handle)) => self.close_pair(handle),
                Event::Command(RelayCommand::Snapshot(reply)) => {
                    let _ = reply.send(RelaySnapshot {
                        pairs: self.pairs.len(),
                        watched: self.armed.len(),
                        suspended: self.suspended.len(),
                    });
                }
                Event::Readable(id, result) => {
                    self.armed.remove(&id);
                    self.on_readable(id, result);
                }
            }
        }

        for connection in self.pairs.values() {
            connection.terminate();
        }
        debug!(target = %self.target, "relay engine stopped");
    }

    fn register(&mut self, connection: Connection) {
        if connection.is_terminated() {
            return;
        }
        let client = connection.client().id();
        let server = connection.server().id();
        debug!(target = %self.target, connection = %connection, "relaying connection");

        self.clients.insert(client, server);
        self.servers.insert(server, client);
        self.pairs.insert(client, connection);
        self.arm(client);
        self.arm(server);
    }

    fn route(&self, src: HandleId) -> Option<Route> {
        if let Some(client) = self.servers.get(&src) {
            let connection = self.pairs.get(client)?.clone();
            return Some(Route {
                src: Arc::clone(connection.server()),
                dst: Arc::clone(connection.client()),
                direction: Direction::ServerToClient,
                connection,
            });
        }
        let connection = self.pairs.get(&src)?.clone();
        Some(Route {
            src: Arc::clone(connection.client()),
            dst: Arc::clone(connection.server()),
            direction: Direction::ClientToServer,
            connection,
        })
    }

    fn arm(&mut self, id: HandleId) {
        if self.suspended.contains(&id) || !self.armed.insert(id) {
            return;
        }
        let Some(route) = self.route(id) else {
            self.armed.remove(&id);
            return;
        };
        if route.src.is_read_shutdown() {
            self.armed.remove(&id);
            return;
        }
        let src = route.src;
        self.readable.push(Box::pin(async move {
            let result = src.stream().readable().await;
            (id, result)
        }));
    }

    fn on_readable(&mut self, id: HandleId, result: io::Result<()>) {
        // Purged pairs may still have a readiness future in flight.
        let Some(route) = self.route(id) else {
            return;
        };
        if let Err(e) = result {
            warn!(target = %self.target, handle = %id, error = %e, "readiness wait failed");
            self.close_pair(id);
            return;
        }
        if self.suspended.contains(&id) {
            return;
        }
        self.pump(id, route);
    }

    /// Move bytes from `id` to its peer until the source runs dry.
    fn pump(&mut self, id: HandleId, route: Route) {
        for _ in 0..MAX_READS_PER_WAKE {
            let n = match route.src.stream().try_read(&mut self.buffer) {
                Ok(0) => {
                    self.on_eof(id, &route);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.arm(id);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(target = %self.target, handle = %id, error = %e, "read failed");
                    self.close_pair(id);
                    return;
                }
            };

            self.stats.record(route.direction, n);
            let data = self.review(&route, Bytes::copy_from_slice(&self.buffer[..n]));
            trace!(
                target = %self.target,
                handle = %id,
                direction = %route.direction,
                read = n,
                forwarded = data.len(),
                "relayed"
            );
            if data.is_empty() {
                continue;
            }

            match write_available(&route.dst, &data) {
                Ok(written) if written == data.len() => {}
                Ok(written) => {
                    self.suspended.insert(id);
                    let _ = self.delayed.send(DelayedCommand::Queue(PendingWrite {
                        dst: Arc::clone(&route.dst),
                        src: id,
                        direction: route.direction,
                        data: data.slice(written..),
                    }));
                    return;
                }
                Err(e) => {
                    debug!(target = %self.target, handle = %route.dst.id(), error = %e, "write failed");
                    self.close_pair(id);
                    return;
                }
            }
        }
        self.arm(id);
    }

    fn review(&self, route: &Route, mut data: Bytes) -> Bytes {
        let client = route.connection.client();
        let server = route.connection.server();
        for algorithm in self.chain.load().iter() {
            data = match route.direction {
                Direction::ClientToServer => algorithm.review_client_to_server(client, server, data),
                Direction::ServerToClient => algorithm.review_server_to_client(client, server, data),
            };
        }
        data
    }

    fn on_eof(&mut self, id: HandleId, route: &Route) {
        if !self.half_close {
            trace!(target = %self.target, connection = %route.connection, "peer closed");
            self.close_pair(id);
            return;
        }

        let src = &route.src;
        let dst = &route.dst;
        let result = (|| -> io::Result<()> {
            if src.is_write_shutdown() {
                src.close();
            } else {
                src.shutdown_read()?;
            }
            if dst.is_read_shutdown() {
                dst.close();
            } else {
                dst.shutdown_write()?;
            }
            Ok(())
        })();

        match result {
            Err(e) => {
                debug!(target = %self.target, handle = %id, error = %e, "half-close failed");
                self.close_pair(id);
            }
            Ok(()) if src.is_closed() && dst.is_closed() => {
                trace!(target = %self.target, connection = %route.connection, "both halves closed");
                self.close_pair(id);
            }
            Ok(()) => {
                trace!(target = %self.target, handle = %id, direction = %route.direction, "half-closed");
            }
        }
    }

    /// Terminate the pair containing `handle` and forget it.
    fn close_pair(&mut self, handle: HandleId) {
        let client = match self.servers.get(&handle) {
            Some(client) => *client,
            None => handle,
        };
        let Some(connection) = self.pairs.remove(&client) else {
            return;
        };
        connection.terminate();

        let server = connection.server().id();
        self.clients.remove(&client);
        self.servers.remove(&server);
        self.suspended.remove(&client);
        self.suspended.remove(&server);
        let _ = self.delayed.send(DelayedCommand::Discard([client, server]));
        debug!(target = %self.target, connection = %connection, "connection closed");
    }
}

/// Write as much of `data` as the socket accepts right now.
fn write_available(dst: &Endpoint, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match dst.stream().try_write(&data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::algorithms::DistributionAlgorithm;
    use crate::backend::Target;
    use crate::config::TargetSettings;
    use crate::proxy::Client;
    use crate::util::ShutdownSignal;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    /// Rewrites client bytes one at a time.
    struct MapBytes {
        name: &'static str,
        map: fn(u8) -> u8,
    }

    impl DistributionAlgorithm for MapBytes {
        fn name(&self) -> &'static str {
            self.name
        }

        fn try_to_connect(&self, client: Client) {
            client.close();
        }

        fn review_client_to_server(&self, _client: &Endpoint, _server: &Endpoint, data: Bytes) -> Bytes {
            data.iter().map(|b| (self.map)(*b)).collect::<Vec<u8>>().into()
        }

        fn table_sizes(&self) -> Vec<(&'static str, usize)> {
            Vec::new()
        }

        fn start(self: Arc<Self>, _shutdown: &ShutdownSignal) {}
    }

    /// Swallows everything the backend sends.
    struct DropReplies;

    impl DistributionAlgorithm for DropReplies {
        fn name(&self) -> &'static str {
            "drop_replies"
        }

        fn try_to_connect(&self, client: Client) {
            client.close();
        }

        fn review_server_to_client(&self, _client: &Endpoint, _server: &Endpoint, _data: Bytes) -> Bytes {
            Bytes::new()
        }

        fn table_sizes(&self) -> Vec<(&'static str, usize)> {
            Vec::new()
        }

        fn start(self: Arc<Self>, _shutdown: &ShutdownSignal) {}
    }

    /// A target relaying one loopback pair. Returns the target and the
    /// far ends: what the user and the backend see.
    async fn relayed_pair(algorithms: Vec<Arc<dyn DistributionAlgorithm>>) -> (Arc<Target>, TcpStream, TcpStream) {
        let chain = AlgorithmChain::new();
        chain.set(algorithms);

        let listener = assert_ok!(TcpListener::bind("127.0.0.1:0").await);
        let addr = assert_ok!(listener.local_addr());
        let target = Target::new(addr, TargetSettings::default(), chain);

        let (user, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server_side, backend) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let client = assert_ok!(Client::new(assert_ok!(accepted).0));
        let connection = assert_ok!(Connection::new(client, assert_ok!(server_side), &target));
        target.add_connection(connection);

        (target, assert_ok!(user), assert_ok!(backend).0)
    }

    #[tokio::test]
    async fn test_review_hooks_run_in_chain_order() {
        let (_target, mut user, mut backend) = relayed_pair(vec![
            Arc::new(MapBytes {
                name: "increment",
                map: |b| b.wrapping_add(1),
            }) as Arc<dyn DistributionAlgorithm>,
            Arc::new(MapBytes {
                name: "double",
                map: |b| b.wrapping_mul(2),
            }),
        ])
        .await;

        assert_ok!(user.write_all(b"abc").await);
        let mut forwarded = [0u8; 3];
        assert_ok!(assert_ok!(timeout(Duration::from_secs(2), backend.read_exact(&mut forwarded)).await));
        // (b + 1) * 2, not b * 2 + 1.
        assert_eq!(forwarded, [196, 198, 200]);

        // The reply direction is left alone.
        assert_ok!(backend.write_all(b"ok").await);
        let mut reply = [0u8; 2];
        assert_ok!(assert_ok!(timeout(Duration::from_secs(2), user.read_exact(&mut reply)).await));
        assert_eq!(&reply, b"ok");
    }

    #[tokio::test]
    async fn test_empty_review_drops_chunk() {
        let (target, mut user, mut backend) =
            relayed_pair(vec![Arc::new(DropReplies) as Arc<dyn DistributionAlgorithm>]).await;

        assert_ok!(backend.write_all(b"secret").await);
        drop(backend);

        let mut received = Vec::new();
        let read = assert_ok!(timeout(Duration::from_secs(2), user.read_to_end(&mut received)).await);
        assert_ok!(read);
        assert!(received.is_empty());
        assert_eq!(target.stats().server_to_client(), 6);
    }
}
