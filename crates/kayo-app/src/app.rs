use std::time::Duration;

use anyhow::{Context, Result};
use kayo_core::{ServerConfig, TlsMode};
use kayo_server::SignalingServer;
use tracing::{info, warn};

/// How often the open-session count is logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Server lifecycle.
///
/// 1. Read `ServerConfig` from the environment (`PORT`, `KAYO_ENV`, ...)
/// 2. Bind, generating the dev certificate pair on first run if needed
/// 3. Serve until ctrl-c, then drain every session
pub async fn run() -> Result<()> {
    let config = ServerConfig::from_env().context("reading server configuration")?;
    match &config.tls {
        TlsMode::Plain => info!("Serving plain ws:// (terminate TLS in front of this process)"),
        TlsMode::DevSelfSigned => info!(
            cert_dir = %config.cert_dir.display(),
            "Development mode: self-signed wss://"
        ),
        TlsMode::Provided { cert_path, .. } => {
            info!(cert = %cert_path.display(), "Serving wss:// with the provided certificate")
        }
    }

    let server = SignalingServer::bind(config.clone())
        .await
        .with_context(|| format!("binding {}", config.listen_addr()))?;
    let addr = server.local_addr()?;
    let scheme = if config.is_tls() { "wss" } else { "ws" };
    info!("Clients connect to {scheme}://{addr}/?projectID=<session key>");

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            return;
        }
        info!("Ctrl-C received, shutting down");
        shutdown.shutdown();
    });

    let registry = server.registry();
    let status = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(sessions = registry.len(), "Status");
        }
    });

    let result = server.run().await;
    status.abort();
    result.context("signaling server stopped with an error")
}
