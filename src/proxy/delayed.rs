//! Backlog flushing for the relay engine.
//!
//! When a destination socket cannot take everything the relay read from
//! its source, the remainder is parked here. This task waits for the
//! destination to become writable, drains the backlog, and then tells the
//! relay engine to resume reading from the source.

use crate::proxy::connection::Endpoint;
use crate::proxy::relay::{Direction, RelayCommand};
use crate::util::HandleId;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Bytes waiting for `dst` to become writable.
pub(crate) struct PendingWrite {
    pub dst: Arc<Endpoint>,
    pub src: HandleId,
    pub direction: Direction,
    pub data: Bytes,
}

pub(crate) enum DelayedCommand {
    /// Park unsent bytes. The relay has already suspended reads on `src`.
    Queue(PendingWrite),
    /// Forget anything queued for these destinations.
    Discard([HandleId; 2]),
}

type Writable = BoxFuture<'static, (HandleId, io::Result<()>)>;

/// Start the helper task for one relay engine.
///
/// The helper only holds a weak sender back to the relay, so dropping the
/// relay's own command senders still shuts both tasks down.
pub(crate) fn spawn_delayed_writer(
    target: SocketAddr,
    relay: mpsc::WeakUnboundedSender<RelayCommand>,
) -> mpsc::UnboundedSender<DelayedCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = DelayedWriter {
        target,
        relay,
        commands: rx,
        pending: HashMap::new(),
        armed: HashSet::new(),
        writable: FuturesUnordered::new(),
    };
    tokio::spawn(writer.run());
    tx
}

struct DelayedWriter {
    target: SocketAddr,
    relay: mpsc::WeakUnboundedSender<RelayCommand>,
    commands: mpsc::UnboundedReceiver<DelayedCommand>,
    pending: HashMap<HandleId, PendingWrite>,
    armed: HashSet<HandleId>,
    writable: FuturesUnordered<Writable>,
}

enum Event {
    Command(DelayedCommand),
    Writable(HandleId, io::Result<()>),
}

impl DelayedWriter {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => break,
                },
                Some((id, result)) = self.writable.next(), if !self.writable.is_empty() => {
                    Event::Writable(id, result)
                }
            };

            match event {
                Event::Command(DelayedCommand::Queue(write)) => self.queue(write),
                Event::Command(DelayedCommand::Discard(ids)) => {
                    for id in ids {
                        self.pending.remove(&id);
                    }
                }
                Event::Writable(id, result) => {
                    self.armed.remove(&id);
                    self.flush(id, result);
                }
            }
        }
        debug!(target = %self.target, "delayed writer stopped");
    }

    fn queue(&mut self, write: PendingWrite) {
        let dst = write.dst.id();
        trace!(
            target = %self.target,
            dst = %dst,
            direction = %write.direction,
            bytes = write.data.len(),
            "queueing delayed write"
        );

        match self.pending.get_mut(&dst) {
            Some(existing) => {
                let mut joined = BytesMut::with_capacity(existing.data.len() + write.data.len());
                joined.extend_from_slice(&existing.data);
                joined.extend_from_slice(&write.data);
                existing.data = joined.freeze();
            }
            None => {
                self.pending.insert(dst, write);
            }
        }
        self.arm(dst);
    }

    fn arm(&mut self, id: HandleId) {
        let Some(write) = self.pending.get(&id) else {
            return;
        };
        if !self.armed.insert(id) {
            return;
        }
        let dst = Arc::clone(&write.dst);
        self.writable.push(Box::pin(async move {
            let result = dst.stream().writable().await;
            (id, result)
        }));
    }

    fn flush(&mut self, id: HandleId, ready: io::Result<()>) {
        let Some(write) = self.pending.get_mut(&id) else {
            return;
        };

        let outcome = ready.and_then(|()| {
            while !write.data.is_empty() {
                match write.dst.stream().try_write(&write.data) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => {
                        let _ = write.data.split_to(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(write.data.is_empty())
        });

        match outcome {
            Ok(false) => self.arm(id),
            Ok(true) => {
                if let Some(write) = self.pending.remove(&id) {
                    trace!(target = %self.target, dst = %id, "delayed write drained");
                    self.notify(RelayCommand::Reactivate(write.src));
                }
            }
            Err(e) => {
                if let Some(write) = self.pending.remove(&id) {
                    debug!(target = %self.target, dst = %id, error = %e, "delayed write failed");
                    self.notify(RelayCommand::Close(write.src));
                }
            }
        }
    }

    fn notify(&self, command: RelayCommand) {
        if let Some(relay) = self.relay.upgrade() {
            let _ = relay.send(command);
        }
    }
}
