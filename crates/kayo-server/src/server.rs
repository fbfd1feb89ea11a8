use std::net::SocketAddr;
use std::sync::Arc;

use kayo_core::{KayoError, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::connection::serve;
use crate::registry::Registry;
use crate::tls;

/// Resolves once `rx` reads `true` (or its sender is gone).
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

// ── ShutdownHandle ───────────────────────────────────────────────────────────

/// Stops a running [`SignalingServer`]: no more accepts, every session drained.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

// ── SignalingServer ──────────────────────────────────────────────────────────

/// WebSocket signaling server.
///
/// ```text
/// bind(config) ─► local_addr() ─► run() ... shutdown_handle().shutdown()
///                                   │
///                                   └─ one task per connection
///                                        ├─ handshake (projectID → session)
///                                        ├─ reader: dispatch / relay
///                                        └─ writer: drains Outbound queue
/// ```
pub struct SignalingServer {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    registry: Arc<Registry>,
    ws_config: WebSocketConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SignalingServer {
    pub async fn bind(config: ServerConfig) -> Result<Self, KayoError> {
        config.validate()?;
        let acceptor = tls::acceptor(&config)?;
        let listener = TcpListener::bind(config.listen_addr()).await?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);
        ws_config.max_frame_size = Some(config.max_message_size);

        let (shutdown, _) = watch::channel(false);

        info!(
            addr = %listener.local_addr()?,
            tls = acceptor.is_some(),
            max_message_size = config.max_message_size,
            "Signaling server listening"
        );

        Ok(Self {
            listener,
            acceptor,
            registry: Arc::new(Registry::new()),
            ws_config,
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, KayoError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { tx: self.shutdown.clone() }
    }

    /// Accept connections until shut down, then drain every session.
    pub async fn run(self) -> Result<(), KayoError> {
        let mut stop = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, addr)) => self.spawn_connection(tcp, addr),
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }

        info!("Signaling server shutting down");
        self.registry.drain();
        Ok(())
    }

    fn spawn_connection(&self, tcp: TcpStream, addr: SocketAddr) {
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(%addr, error = %e, "set_nodelay failed");
        }
        let registry = self.registry.clone();
        let ws_config = self.ws_config;
        let stop = self.shutdown.subscribe();

        match self.acceptor.clone() {
            None => {
                tokio::spawn(serve(tcp, addr, registry, ws_config, stop));
            }
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(tcp).await {
                        Ok(tls) => serve(tls, addr, registry, ws_config, stop).await,
                        Err(e) => warn!(%addr, error = %e, "TLS handshake failed"),
                    }
                });
            }
        }
    }
}
