//! Client-side TLS for `wss://` signaling.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use kayo_core::{ClientConfig, TransportError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{info, warn};

/// Certificate remembered on first connect. Clone it into later connects to
/// refuse a server whose certificate changed.
#[derive(Debug, Clone, Default)]
pub struct CertPin {
    der: Arc<Mutex<Option<Vec<u8>>>>,
}

impl CertPin {
    pub fn new() -> Self {
        Self::default()
    }

    /// DER bytes of the pinned certificate, once a handshake succeeded.
    pub fn pinned(&self) -> Option<Vec<u8>> {
        self.der.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// How a `wss://` server certificate is checked.
#[derive(Debug, Clone)]
pub enum ServerTrust {
    /// Pin the first certificate seen. For the self-signed development server.
    FirstUse(CertPin),
    /// Verify the chain and host name against the CA certificates in a PEM
    /// bundle, e.g. `/etc/ssl/certs/ca-certificates.crt`.
    CaBundle(PathBuf),
}

impl Default for ServerTrust {
    fn default() -> Self {
        Self::FirstUse(CertPin::new())
    }
}

impl ServerTrust {
    /// `CaBundle` when the client config names one, a fresh pin otherwise.
    pub fn for_client(config: &ClientConfig) -> Self {
        match &config.ca_bundle {
            Some(path) => Self::CaBundle(path.clone()),
            None => Self::default(),
        }
    }
}

fn tls_failed(reason: String) -> TransportError {
    TransportError::SendFailed { reason }
}

fn load_roots(path: &Path) -> Result<RootCertStore, TransportError> {
    let file = File::open(path)
        .map_err(|e| tls_failed(format!("CA bundle {}: {e}", path.display())))?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert.map_err(|e| tls_failed(format!("CA bundle {}: {e}", path.display())))?;
        roots
            .add(cert)
            .map_err(|e| tls_failed(format!("CA bundle {}: {e}", path.display())))?;
    }
    if roots.is_empty() {
        return Err(tls_failed(format!("CA bundle {} holds no certificates", path.display())));
    }
    Ok(roots)
}

// ── TOFU certificate verifier ────────────────────────────────────────────────

/// Trust on first use: the development server presents a self-signed
/// certificate, so the first one seen is pinned and later ones must match.
#[derive(Debug)]
struct TofuCertVerifier {
    pin: CertPin,
}

impl ServerCertVerifier for TofuCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut pinned = self.pin.der.lock().unwrap_or_else(|e| e.into_inner());
        match pinned.as_deref() {
            None => {
                info!(bytes = end_entity.len(), "Pinned signaling server certificate");
                *pinned = Some(end_entity.as_ref().to_vec());
                Ok(ServerCertVerified::assertion())
            }
            Some(known) if known == end_entity.as_ref() => Ok(ServerCertVerified::assertion()),
            Some(_) => {
                warn!("Signaling server certificate changed since first use");
                Err(rustls::Error::General("server certificate changed since first use".into()))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS handshake over an established TCP stream.
pub(crate) async fn connect(
    host: &str,
    tcp: TcpStream,
    trust: ServerTrust,
) -> Result<TlsStream<TcpStream>, TransportError> {
    // Ignored when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = match trust {
        ServerTrust::FirstUse(pin) => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TofuCertVerifier { pin }))
            .with_no_client_auth(),
        ServerTrust::CaBundle(path) => rustls::ClientConfig::builder()
            .with_root_certificates(load_roots(&path)?)
            .with_no_client_auth(),
    };
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let server_name = match host.parse::<std::net::IpAddr>() {
        Ok(ip) => ServerName::IpAddress(ip.into()),
        Err(_) => ServerName::try_from(host.to_owned()).map_err(|_| TransportError::SendFailed {
            reason: format!("invalid hostname: {host}"),
        })?,
    };

    connector.connect(server_name, tcp).await.map_err(|e| TransportError::SendFailed {
        reason: format!("TLS handshake with {host}: {e}"),
    })
}
