//! TCP accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connections::ConnectionTable;
use crate::registry::HandlerRegistry;
use crate::session::{Session, SessionConfig};

/// Session lifecycle callbacks.
pub trait SessionObserver: Send + Sync {
    /// A session was accepted and tracked.
    fn on_open(&self, _session: &Arc<Session>) {}
    /// A session closed and was removed from the table.
    fn on_close(&self, session: &Arc<Session>);
}

/// Accepts peer connections and wraps each in a [`Session`].
pub struct Listener {
    listener: TcpListener,
    config: SessionConfig,
    registry: Arc<HandlerRegistry>,
    connections: Arc<ConnectionTable>,
    max_connections: usize,
    observer: Option<Arc<dyn SessionObserver>>,
}

impl Listener {
    /// Bind to `addr`.
    pub async fn bind(
        addr: &str,
        config: SessionConfig,
        registry: Arc<HandlerRegistry>,
        connections: Arc<ConnectionTable>,
        max_connections: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config,
            registry,
            connections,
            max_connections,
            observer: None,
        })
    }

    /// Attach lifecycle callbacks.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Bound address (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled, then close every
    /// tracked session.
    pub async fn run(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, "listening for peers");
        }
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept(stream, addr),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        info!(open = self.connections.len(), "listener stopping");
        self.connections.close_all("server shutting down");
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if self.connections.len() >= self.max_connections {
            warn!(%addr, max = self.max_connections, "connection limit reached, rejecting");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%addr, error = %e, "failed to set TCP_NODELAY");
        }

        let (session, reader) = Session::spawn(
            stream,
            addr.to_string(),
            self.config.clone(),
            Arc::clone(&self.registry),
        );
        info!(session_id = session.id(), %addr, "peer connected");
        self.connections.add(Arc::clone(&session));
        if let Some(observer) = &self.observer {
            observer.on_open(&session);
        }

        let connections = Arc::clone(&self.connections);
        let observer = self.observer.clone();
        let _ = tokio::spawn(async move {
            let _ = reader.await;
            let _ = connections.remove(session.id());
            if let Some(observer) = observer {
                observer.on_close(&session);
            }
        });
    }
}
