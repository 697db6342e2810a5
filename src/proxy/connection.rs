//! Sockets and the client↔backend pairing relayed by a target.

use crate::backend::Target;
use crate::util::{ConnectionId, HandleId};
use socket2::SockRef;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tracing::trace;

/// One socket of a proxied connection.
///
/// Tracks which halves have been shut down so that the relay engine's
/// half-close logic and `Connection::is_terminated` agree on the real state
/// of the socket.
#[derive(Debug)]
pub struct Endpoint {
    id: HandleId,
    peer: SocketAddr,
    stream: TcpStream,
    read_shut: AtomicBool,
    write_shut: AtomicBool,
    closed: AtomicBool,
}

impl Endpoint {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            id: HandleId::next(),
            peer,
            stream,
            read_shut: AtomicBool::new(false),
            write_shut: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Address of the remote side of this socket.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Stop reading; the peer may keep receiving what we write.
    pub fn shutdown_read(&self) -> io::Result<()> {
        if !self.read_shut.swap(true, Ordering::AcqRel) {
            trace!(handle = %self.id, "shutting down read half");
            ignore_not_connected(SockRef::from(&self.stream).shutdown(Shutdown::Read))?;
        }
        Ok(())
    }

    /// Send FIN to the peer while still accepting its data.
    pub fn shutdown_write(&self) -> io::Result<()> {
        if !self.write_shut.swap(true, Ordering::AcqRel) {
            trace!(handle = %self.id, "shutting down write half");
            ignore_not_connected(SockRef::from(&self.stream).shutdown(Shutdown::Write))?;
        }
        Ok(())
    }

    pub fn is_read_shutdown(&self) -> bool {
        self.read_shut.load(Ordering::Acquire)
    }

    pub fn is_write_shutdown(&self) -> bool {
        self.write_shut.load(Ordering::Acquire)
    }

    /// Shut down both halves. Idempotent.
    ///
    /// The descriptor itself is released once the last owner drops the
    /// endpoint; after this call the socket is unusable in both directions.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.read_shut.store(true, Ordering::Release);
        self.write_shut.store(true, Ordering::Release);
        if let Err(e) = ignore_not_connected(SockRef::from(&self.stream).shutdown(Shutdown::Both)) {
            trace!(handle = %self.id, error = %e, "error closing socket");
        }
    }

    /// Closed explicitly, or both halves shut down one at a time.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || (self.is_read_shutdown() && self.is_write_shutdown())
    }
}

/// A peer that already reset the socket reports `NotConnected` on shutdown.
fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

/// An accepted client that has not been paired with a backend yet.
#[derive(Debug)]
pub struct Client {
    endpoint: Endpoint,
}

impl Client {
    /// Wrap a freshly accepted stream.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new(stream)?,
        })
    }

    pub fn id(&self) -> HandleId {
        self.endpoint.id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.endpoint.peer()
    }

    /// Give up on this client.
    pub fn close(self) {
        self.endpoint.close();
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {} ({})", self.endpoint.peer, self.endpoint.id)
    }
}

/// A client paired with a backend socket on a particular target.
///
/// Cheap to clone; clones share the same sockets and termination state. The
/// target owns its connections; a connection only refers back to its target
/// weakly.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    client: Arc<Endpoint>,
    server: Arc<Endpoint>,
    target: Weak<Target>,
    terminated: AtomicBool,
}

impl Connection {
    /// Pair an accepted client with a freshly connected backend socket.
    pub fn new(client: Client, server: TcpStream, target: &Arc<Target>) -> io::Result<Self> {
        let server = match Endpoint::new(server) {
            Ok(server) => server,
            Err(e) => {
                client.close();
                return Err(e);
            }
        };

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::next(),
                client: Arc::new(client.endpoint),
                server: Arc::new(server),
                target: Arc::downgrade(target),
                terminated: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn client(&self) -> &Arc<Endpoint> {
        &self.inner.client
    }

    pub fn server(&self) -> &Arc<Endpoint> {
        &self.inner.server
    }

    /// The target this connection belongs to, if it still exists.
    pub fn target(&self) -> Option<Arc<Target>> {
        self.inner.target.upgrade()
    }

    /// Close both sockets. Idempotent.
    pub fn terminate(&self) {
        if !self.inner.terminated.swap(true, Ordering::AcqRel) {
            trace!(connection = %self, "terminating");
        }
        self.inner.client.close();
        self.inner.server.close();
    }

    /// Whether both sockets are closed, however that happened.
    pub fn is_terminated(&self) -> bool {
        if self.inner.terminated.load(Ordering::Acquire) {
            return true;
        }
        if self.inner.client.is_closed() && self.inner.server.is_closed() {
            self.inner.terminated.store(true, Ordering::Release);
            return true;
        }
        false
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.inner.id,
            self.inner.client.peer(),
            self.inner.server.peer()
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("client", &self.inner.client.peer())
            .field("server", &self.inner.server.peer())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
