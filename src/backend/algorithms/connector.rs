//! Outbound connect machinery shared by every algorithm.
//!
//! `initiate_connection` starts a connect in the background and records it
//! as pending. A completion worker collects finished attempts and a timeout
//! detector fails attempts that take longer than the connect timeout. Both
//! report to the owning algorithm through `ConnectHandler`.

use crate::backend::Target;
use crate::metrics::{ConnectResult, MetricsCollector};
use crate::proxy::{Client, Connection};
use crate::util::{HandleId, ShutdownSignal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, trace, warn};

type AttemptResult = (HandleId, io::Result<TcpStream>);

/// Floor for the completion wait and the timeout scan period.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// An outbound connect in flight on behalf of a client.
pub struct PendingConnection {
    pub client: Client,
    pub target: Arc<Target>,
    pub started: Instant,
    attempt: JoinHandle<()>,
}

/// How an attempt ended.
pub enum ConnectOutcome {
    Connected(Connection),
    Failed { client: Client, target: Arc<Target> },
    /// The connect succeeded but the pair could not be set up, and the
    /// client has been closed.
    Abandoned(HandleId),
}

/// Receives the results of an algorithm's connect attempts.
pub trait ConnectHandler: Send + Sync + 'static {
    fn on_connected(&self, connection: Connection);

    /// The attempt to `target` failed or timed out. The target's failure
    /// count has already been incremented.
    fn on_failed(&self, client: Client, target: Arc<Target>);

    /// The client is gone. Drop anything kept for it.
    fn on_abandoned(&self, client: HandleId);
}

pub struct Connector {
    algorithm: &'static str,
    connect_timeout: Duration,
    metrics: MetricsCollector,
    pending: Mutex<HashMap<HandleId, PendingConnection>>,
    /// Attempts moved out of `pending` by the timeout detector.
    failed: Mutex<Vec<(Client, Arc<Target>)>>,
    results_tx: mpsc::UnboundedSender<AttemptResult>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<AttemptResult>>>,
}

impl Connector {
    pub fn new(algorithm: &'static str, connect_timeout: Duration, metrics: MetricsCollector) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            algorithm,
            connect_timeout,
            metrics,
            pending: Mutex::new(HashMap::new()),
            failed: Mutex::new(Vec::new()),
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
        }
    }

    /// Half the connect timeout: how long the completion worker waits per
    /// round and how often the timeout detector scans.
    fn poll_interval(&self) -> Duration {
        (self.connect_timeout / 2).max(MIN_POLL_INTERVAL)
    }

    /// Start connecting `client` to `target` without waiting for the result.
    pub fn initiate_connection(&self, client: Client, target: Arc<Target>) {
        let id = client.id();
        let address = target.address();
        trace!(algorithm = self.algorithm, client = %client.peer(), target = %address, "connecting");

        // The entry is inserted before the lock is released, so the result
        // can never be processed before its pending entry exists.
        let mut pending = self.pending.lock();
        let results = self.results_tx.clone();
        let attempt = tokio::spawn(async move {
            let result = TcpStream::connect(address).await;
            let _ = results.send((id, result));
        });
        pending.insert(
            id,
            PendingConnection {
                client,
                target,
                started: Instant::now(),
                attempt,
            },
        );
    }

    /// Wait up to half the connect timeout for attempts to finish, then
    /// return everything that completed, failed or timed out.
    ///
    /// Cancel safe: nothing is lost if the future is dropped while waiting.
    pub async fn check_for_completed_connections(
        &self,
        results: &mut mpsc::UnboundedReceiver<AttemptResult>,
    ) -> Vec<ConnectOutcome> {
        let mut outcomes = Vec::new();

        if let Ok(Some(first)) = timeout(self.poll_interval(), results.recv()).await {
            self.complete(first, &mut outcomes);
            while let Ok(next) = results.try_recv() {
                self.complete(next, &mut outcomes);
            }
        }

        outcomes.extend(
            self.failed
                .lock()
                .drain(..)
                .map(|(client, target)| ConnectOutcome::Failed { client, target }),
        );
        outcomes
    }

    fn complete(&self, (id, result): AttemptResult, outcomes: &mut Vec<ConnectOutcome>) {
        // Already failed by the timeout detector.
        let Some(pending) = self.pending.lock().remove(&id) else {
            return;
        };
        let PendingConnection { client, target, .. } = pending;

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                debug!(
                    algorithm = self.algorithm,
                    client = %client.peer(),
                    target = %target.address(),
                    error = %e,
                    "connect failed"
                );
                self.metrics.record_connect_attempt(ConnectResult::Failure);
                target.increment_failure_count();
                outcomes.push(ConnectOutcome::Failed { client, target });
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on backend connection");
        }
        target.reset_failure_count();
        self.metrics.record_connect_attempt(ConnectResult::Success);

        match Connection::new(client, stream, &target) {
            Ok(connection) => {
                debug!(algorithm = self.algorithm, connection = %connection, "connected");
                outcomes.push(ConnectOutcome::Connected(connection));
            }
            Err(e) => {
                debug!(target = %target.address(), error = %e, "backend socket unusable");
                outcomes.push(ConnectOutcome::Abandoned(id));
            }
        }
    }

    /// Fail every attempt older than the connect timeout. Returns how many
    /// were failed.
    pub fn expire_timed_out(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<PendingConnection> = {
            let mut pending = self.pending.lock();
            let ids: Vec<HandleId> = pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.started) >= self.connect_timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        let count = expired.len();
        for pending in expired {
            pending.attempt.abort();
            debug!(
                algorithm = self.algorithm,
                client = %pending.client.peer(),
                target = %pending.target.address(),
                "connect timed out"
            );
            self.metrics.record_connect_attempt(ConnectResult::Timeout);
            pending.target.increment_failure_count();
            self.failed.lock().push((pending.client, pending.target));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.lock().len()
    }

    /// Spawn the completion worker and the timeout detector.
    ///
    /// Only the first call has any effect.
    pub fn start<H: ConnectHandler>(self: &Arc<Self>, handler: Arc<H>, shutdown: &ShutdownSignal) {
        let Some(mut results) = self.results_rx.lock().take() else {
            warn!(algorithm = self.algorithm, "connector already started");
            return;
        };

        let connector = Arc::clone(self);
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    outcomes = connector.check_for_completed_connections(&mut results) => {
                        for outcome in outcomes {
                            match outcome {
                                ConnectOutcome::Connected(connection) => handler.on_connected(connection),
                                ConnectOutcome::Failed { client, target } => handler.on_failed(client, target),
                                ConnectOutcome::Abandoned(id) => handler.on_abandoned(id),
                            }
                        }
                    }
                }
            }
            connector.abandon_all();
            debug!(algorithm = connector.algorithm, "completion worker stopped");
        });

        let connector = Arc::clone(self);
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(connector.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = ticker.tick() => {
                        connector.expire_timed_out();
                    }
                }
            }
        });
    }

    /// Drop every in-flight attempt and its client.
    fn abandon_all(&self) {
        let pending: Vec<PendingConnection> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for p in pending {
            p.attempt.abort();
            p.client.close();
        }
        for (client, _) in self.failed.lock().drain(..) {
            client.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::algorithms::AlgorithmChain;
    use crate::config::TargetSettings;
    use socket2::SockRef;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;

    async fn accepted_client() -> (Client, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (Client::new(accepted.unwrap().0).unwrap(), peer.unwrap())
    }

    fn target(address: std::net::SocketAddr, limit: u32) -> Arc<Target> {
        let settings = TargetSettings {
            failure_count_limit: limit,
            ..TargetSettings::default()
        };
        Target::new(address, settings, AlgorithmChain::default())
    }

    fn connector(connect_timeout: Duration) -> (Connector, mpsc::UnboundedReceiver<AttemptResult>) {
        let connector = Connector::new("test", connect_timeout, MetricsCollector::new());
        let results = connector.results_rx.lock().take().unwrap();
        (connector, results)
    }

    async fn collect(
        connector: &Connector,
        results: &mut mpsc::UnboundedReceiver<AttemptResult>,
    ) -> Vec<ConnectOutcome> {
        for _ in 0..20 {
            let outcomes = connector.check_for_completed_connections(results).await;
            if !outcomes.is_empty() {
                return outcomes;
            }
        }
        Vec::new()
    }

    #[tokio::test]
    async fn test_successful_connect_resets_failures() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target(backend.local_addr().unwrap(), 5);
        target.increment_failure_count();

        let (connector, mut results) = connector(Duration::from_secs(2));
        let (client, _peer) = accepted_client().await;
        connector.initiate_connection(client, Arc::clone(&target));
        assert_eq!(connector.pending_count(), 1);

        let outcomes = collect(&connector, &mut results).await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], ConnectOutcome::Connected(_)));
        assert_eq!(target.failure_count(), 0);
        assert_eq!(connector.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_connect_counts_failure() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let target = target(addr, 5);

        let (connector, mut results) = connector(Duration::from_secs(2));
        let (client, _peer) = accepted_client().await;
        let client_id = client.id();
        connector.initiate_connection(client, Arc::clone(&target));

        let outcomes = collect(&connector, &mut results).await;
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            ConnectOutcome::Failed { client, target: failed } => {
                assert_eq!(client.id(), client_id);
                assert_eq!(failed.address(), addr);
            }
            _ => panic!("expected failure"),
        }
        assert_eq!(target.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_moves_attempt_to_failed() {
        // Non-routable address: the connect hangs until aborted.
        let target = target("10.255.255.1:12345".parse().unwrap(), 5);

        let (connector, mut results) = connector(Duration::from_millis(100));
        let (client, _peer) = accepted_client().await;
        connector.initiate_connection(client, Arc::clone(&target));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(connector.expire_timed_out(), 1);
        assert_eq!(connector.pending_count(), 0);
        assert_eq!(connector.failed_count(), 1);
        assert_eq!(target.failure_count(), 1);

        let outcomes = connector.check_for_completed_connections(&mut results).await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], ConnectOutcome::Failed { .. }));
        assert_eq!(connector.failed_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_backend_abandons_client() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target(backend.local_addr().unwrap(), 5);
        let (connector, _results) = connector(Duration::from_secs(2));

        // The backend accepts and immediately resets the connection.
        let (stream, accepted) = tokio::join!(
            TcpStream::connect(backend.local_addr().unwrap()),
            backend.accept()
        );
        let (accepted, _) = assert_ok!(accepted);
        assert_ok!(SockRef::from(&accepted).set_linger(Some(Duration::ZERO)));
        drop(accepted);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (client, mut peer) = accepted_client().await;
        let id = client.id();
        connector.pending.lock().insert(
            id,
            PendingConnection {
                client,
                target: Arc::clone(&target),
                started: Instant::now(),
                attempt: tokio::spawn(async {}),
            },
        );

        let mut outcomes = Vec::new();
        connector.complete((id, stream), &mut outcomes);

        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], ConnectOutcome::Abandoned(abandoned) if abandoned == id));
        assert_eq!(connector.pending_count(), 0);

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .expect("client was never closed");
        assert_eq!(read.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_young_attempts_not_expired() {
        let target = target("10.255.255.1:12345".parse().unwrap(), 5);
        let (connector, _results) = connector(Duration::from_secs(10));
        let (client, _peer) = accepted_client().await;
        connector.initiate_connection(client, target);

        assert_eq!(connector.expire_timed_out(), 0);
        assert_eq!(connector.pending_count(), 1);
    }
}
