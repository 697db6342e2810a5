//! Frontend listener implementation.
//!
//! Accepts incoming connections and offers them to the dispatcher.

use crate::backend::DispatcherHandle;
use crate::proxy::Client;
use crate::util::ShutdownListener;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Frontend listener that accepts client connections.
pub struct FrontendListener {
    listener: TcpListener,
    dispatcher: DispatcherHandle,
}

impl FrontendListener {
    /// Bind the listen socket.
    pub async fn bind(address: SocketAddr, dispatcher: DispatcherHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        info!(listen = %listener.local_addr()?, "frontend listener bound");
        Ok(Self { listener, dispatcher })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting connections until shutdown.
    pub async fn run(self, mut shutdown: ShutdownListener) {
        info!("frontend listener starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.handle_connection(stream, addr),
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("frontend listener shutting down");
                    break;
                }
            }
        }
    }

    /// Wrap an accepted stream and hand it to the dispatcher.
    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(client = %client_addr, error = %e, "failed to set TCP_NODELAY on client connection");
        }

        match Client::new(stream) {
            Ok(client) => {
                debug!(client = %client_addr, id = %client.id(), "accepted client");
                self.dispatcher.offer_unconnected(client);
            }
            Err(e) => {
                warn!(client = %client_addr, error = %e, "dropping client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DispatchEvent, Dispatcher};
    use crate::util::ShutdownSignal;
    use std::time::Duration;

    #[tokio::test]
    async fn test_accepted_clients_are_offered() {
        let (handle, mut events) = Dispatcher::channel();
        let listener = FrontendListener::bind("127.0.0.1:0".parse().unwrap(), handle)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = ShutdownSignal::new();
        tokio::spawn(listener.run(shutdown.subscribe()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();

        match event {
            DispatchEvent::Unconnected(client) => {
                assert_eq!(client.peer(), stream.local_addr().unwrap());
            }
            DispatchEvent::Finished(_) | DispatchEvent::Abandoned(_) => {
                panic!("expected an unconnected client")
            }
        }

        shutdown.shutdown();
    }
}
