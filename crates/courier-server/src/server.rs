//! TCP accept loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use courier_shared::types::ConnectionId;

use crate::config::ServerConfig;
use crate::connection::ConnectionHandler;
use crate::credentials::Blake3Credentials;
use crate::dispatcher::Dispatcher;
use crate::registry::SessionRegistry;
use crate::store::Store;

pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    registry: SessionRegistry,
    max_frame_size: usize,
    next_id: AtomicU64,
}

impl Server {
    /// Bind the listening socket. Fails if the address is unavailable.
    pub async fn bind(config: &ServerConfig, store: Store) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let registry = SessionRegistry::new();
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            registry.clone(),
            Arc::new(Blake3Credentials),
        ));

        Ok(Self {
            listener,
            dispatcher,
            registry,
            max_frame_size: config.max_frame_size,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Accept clients forever, one task per connection.
    pub async fn run(self) {
        if let Ok(addr) = self.local_addr() {
            info!(addr = %addr, "accepting connections");
        }

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }

            let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
            info!(conn = %id, peer = %peer, "client connected");

            let handler = ConnectionHandler::new(
                id,
                peer,
                self.dispatcher.clone(),
                self.registry.clone(),
                self.max_frame_size,
            );
            let (reader, writer) = stream.into_split();
            tokio::spawn(handler.run(reader, writer));
        }
    }
}
