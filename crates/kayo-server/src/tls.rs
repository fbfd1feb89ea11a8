//! TLS for the signaling listener.
//!
//! Development mode generates a self-signed `localhost` pair into the
//! certificate directory on first run and reuses it afterwards, so browsers
//! only have to trust it once.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kayo_core::{KayoError, ServerConfig, TlsMode};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

pub const DEV_CERT_FILE: &str = "cert.pem";
pub const DEV_KEY_FILE: &str = "key.pem";

fn tls_err(reason: impl std::fmt::Display) -> KayoError {
    KayoError::Tls { reason: reason.to_string() }
}

/// Acceptor for the configured mode, `None` for plain `ws://`.
pub fn acceptor(config: &ServerConfig) -> Result<Option<TlsAcceptor>, KayoError> {
    let (cert_path, key_path) = match &config.tls {
        TlsMode::Plain => return Ok(None),
        TlsMode::DevSelfSigned => ensure_dev_certs(&config.cert_dir)?,
        TlsMode::Provided { cert_path, key_path } => (cert_path.clone(), key_path.clone()),
    };
    load_acceptor(&cert_path, &key_path).map(Some)
}

/// Make sure a dev pair exists in `dir`, generating it if either file is
/// missing. Returns `(cert, key)` paths.
pub fn ensure_dev_certs(dir: &Path) -> Result<(PathBuf, PathBuf), KayoError> {
    let cert_path = dir.join(DEV_CERT_FILE);
    let key_path = dir.join(DEV_KEY_FILE);
    if cert_path.exists() && key_path.exists() {
        return Ok((cert_path, key_path));
    }

    fs::create_dir_all(dir)?;
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(tls_err)?;
    fs::write(&cert_path, generated.cert.pem())?;
    fs::write(&key_path, generated.key_pair.serialize_pem())?;
    info!(dir = %dir.display(), "Generated self-signed development certificate");

    Ok((cert_path, key_path))
}

pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, KayoError> {
    // Ignored when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_err)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, KayoError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(tls_err(format!("no certificate in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, KayoError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| tls_err(format!("no private key in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_certs_are_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = ensure_dev_certs(dir.path()).unwrap();
        let first = fs::read(&cert).unwrap();

        ensure_dev_certs(dir.path()).unwrap();
        assert_eq!(fs::read(&cert).unwrap(), first, "existing pair is reused");

        load_acceptor(&cert, &key).expect("generated pair loads");
    }

    #[test]
    fn plain_mode_has_no_acceptor() {
        assert!(acceptor(&ServerConfig::default()).unwrap().is_none());
    }

    #[test]
    fn missing_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _) = ensure_dev_certs(dir.path()).unwrap();
        let empty = dir.path().join("empty.pem");
        fs::write(&empty, "").unwrap();
        assert!(matches!(load_acceptor(&cert, &empty), Err(KayoError::Tls { .. })));
    }
}
