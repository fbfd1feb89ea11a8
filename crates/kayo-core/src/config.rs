use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::KayoError;

/// Default signaling port (`PORT`).
pub const DEFAULT_PORT: u16 = 3000;
/// Largest single WebSocket message the server accepts (32 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;
/// Chunk size used when the channel does not advertise a maximum.
pub const FALLBACK_CHUNK_SIZE: usize = 16 * 1024;
/// Binary frame size of files sent through the signaling server. The server's
/// `max_message_size` must be at least this.
pub const SIGNALING_CHUNK_SIZE: usize = 16 * 1024 * 1024;

// MARK: - TlsMode

/// How the signaling listener secures its connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TlsMode {
    /// Plain `ws://` (production behind a terminating proxy).
    Plain,
    /// `wss://` with a self-signed pair generated into `cert_dir` on first run.
    DevSelfSigned,
    /// `wss://` with an operator-provided PEM pair.
    Provided {
        #[serde(alias = "certPath")]
        cert_path: PathBuf,
        #[serde(alias = "keyPath")]
        key_path: PathBuf,
    },
}

// MARK: - ServerConfig

/// Signaling server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(alias = "bindAddress")]
    pub bind_address: String,
    pub port: u16,
    pub tls: TlsMode,
    #[serde(alias = "certDir")]
    pub cert_dir: PathBuf,
    #[serde(alias = "maxMessageSize")]
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            tls: TlsMode::Plain,
            cert_dir: PathBuf::from("certs"),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Read the configuration from the process environment.
    ///
    /// | Variable                | Meaning                                   |
    /// |-------------------------|-------------------------------------------|
    /// | `PORT`                  | listening port (default 3000)             |
    /// | `KAYO_BIND`             | bind address (default `0.0.0.0`)          |
    /// | `KAYO_ENV`              | `development` enables self-signed TLS     |
    /// | `KAYO_TLS_CERT`/`_KEY`  | PEM pair, takes precedence over dev TLS   |
    /// | `KAYO_CERT_DIR`         | where dev certificates live (`certs`)     |
    /// | `KAYO_MAX_MESSAGE_SIZE` | largest accepted message in bytes         |
    pub fn from_env() -> Result<Self, KayoError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, KayoError> {
        let mut cfg = Self::default();

        if let Some(port) = lookup("PORT") {
            cfg.port = port.trim().parse().map_err(|_| KayoError::ConfigurationInvalid {
                reason: format!("PORT is not a port number: {port:?}"),
            })?;
        }
        if let Some(bind) = lookup("KAYO_BIND") {
            cfg.bind_address = bind;
        }
        if let Some(dir) = lookup("KAYO_CERT_DIR") {
            cfg.cert_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("KAYO_MAX_MESSAGE_SIZE") {
            cfg.max_message_size = size.trim().parse().map_err(|_| KayoError::ConfigurationInvalid {
                reason: format!("KAYO_MAX_MESSAGE_SIZE is not a byte count: {size:?}"),
            })?;
        }

        cfg.tls = match (lookup("KAYO_TLS_CERT"), lookup("KAYO_TLS_KEY")) {
            (Some(cert), Some(key)) => TlsMode::Provided {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            },
            (Some(_), None) | (None, Some(_)) => {
                return Err(KayoError::ConfigurationInvalid {
                    reason: "KAYO_TLS_CERT and KAYO_TLS_KEY must be set together".into(),
                })
            }
            (None, None) if lookup("KAYO_ENV").as_deref() == Some("development") => {
                TlsMode::DevSelfSigned
            }
            (None, None) => TlsMode::Plain,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), KayoError> {
        // tungstenite checks payload length only, so no framing allowance.
        if self.max_message_size < SIGNALING_CHUNK_SIZE {
            return Err(KayoError::ConfigurationInvalid {
                reason: format!(
                    "max_message_size {} is below the {} byte signaling file chunk",
                    self.max_message_size, SIGNALING_CHUNK_SIZE
                ),
            });
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self.tls, TlsMode::Plain)
    }
}

// MARK: - TransferOptions

/// Tuning for the chunked transfer send loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    #[serde(alias = "chunkSizeFallback")]
    pub chunk_size_fallback: usize,
    /// Low-watermark as a multiple of the chunk size.
    #[serde(alias = "lowWatermarkFactor")]
    pub low_watermark_factor: f64,
    /// How long the loop waits for the low-watermark signal before giving up.
    #[serde(alias = "stallTimeoutMs")]
    pub stall_timeout_ms: u64,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size_fallback: FALLBACK_CHUNK_SIZE,
            low_watermark_factor: 3.5,
            stall_timeout_ms: 30_000,
        }
    }
}

impl TransferOptions {
    /// Chunk size for a channel advertising `max_message_size`.
    pub fn chunk_size(&self, max_message_size: Option<usize>) -> usize {
        max_message_size
            .filter(|&m| m > 0)
            .unwrap_or(self.chunk_size_fallback)
            .max(1)
    }

    pub fn low_watermark(&self, chunk_size: usize) -> usize {
        (chunk_size as f64 * self.low_watermark_factor) as usize
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

// MARK: - ClientConfig

/// Configuration of one collaborating client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `ws://host:port` or `wss://host:port`.
    #[serde(alias = "serverUrl")]
    pub server_url: String,
    /// Opaque project/session key sent as the `projectID` query parameter.
    #[serde(alias = "sessionKey")]
    pub session_key: String,
    #[serde(alias = "negotiationTimeoutMs")]
    pub negotiation_timeout_ms: u64,
    pub transfer: TransferOptions,
    /// PEM bundle of CA certificates for verifying a `wss://` server. Without
    /// one the first certificate seen is trusted and pinned.
    #[serde(alias = "caBundle")]
    pub ca_bundle: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{DEFAULT_PORT}"),
            session_key: String::new(),
            negotiation_timeout_ms: 30_000,
            transfer: TransferOptions::default(),
            ca_bundle: None,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, session_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            session_key: session_key.into(),
            ..Self::default()
        }
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_plain_on_port_3000() {
        let cfg = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.tls, TlsMode::Plain);
        assert_eq!(cfg.max_message_size, 32 * 1024 * 1024);
    }

    #[test]
    fn development_enables_self_signed_tls() {
        let cfg = ServerConfig::from_lookup(lookup(&[("KAYO_ENV", "development"), ("PORT", "4443")]))
            .unwrap();
        assert_eq!(cfg.tls, TlsMode::DevSelfSigned);
        assert_eq!(cfg.listen_addr(), "0.0.0.0:4443");
    }

    #[test]
    fn provided_pair_wins_over_development() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("KAYO_ENV", "development"),
            ("KAYO_TLS_CERT", "/etc/kayo/cert.pem"),
            ("KAYO_TLS_KEY", "/etc/kayo/key.pem"),
        ]))
        .unwrap();
        assert!(matches!(cfg.tls, TlsMode::Provided { .. }));
    }

    #[test]
    fn rejects_half_a_pair_and_bad_port() {
        assert!(ServerConfig::from_lookup(lookup(&[("KAYO_TLS_CERT", "c.pem")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])).is_err());
    }

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "bindAddress": "127.0.0.1",
            "port": 8443,
            "tls": {"mode": "dev_self_signed"},
            "certDir": "/tmp/kayo-certs",
            "maxMessageSize": 1048576
        }"#;
        let cfg: ServerConfig = serde_json::from_str(json).expect("valid camelCase config");
        assert_eq!(cfg.bind_address, "127.0.0.1");
        assert_eq!(cfg.tls, TlsMode::DevSelfSigned);
        assert_eq!(cfg.max_message_size, 1_048_576);
        assert!(cfg.validate().is_err(), "1 MiB cannot carry a signaling file chunk");
    }

    #[test]
    fn message_limit_must_fit_a_signaling_chunk() {
        let env = lookup(&[("KAYO_MAX_MESSAGE_SIZE", "1048576")]);
        assert!(ServerConfig::from_lookup(env).is_err());

        let exact = SIGNALING_CHUNK_SIZE.to_string();
        let cfg = ServerConfig::from_lookup(lookup(&[("KAYO_MAX_MESSAGE_SIZE", &exact)])).unwrap();
        assert_eq!(cfg.max_message_size, SIGNALING_CHUNK_SIZE);
    }

    #[test]
    fn chunk_size_falls_back_to_16_kib() {
        let opts = TransferOptions::default();
        assert_eq!(opts.chunk_size(None), 16 * 1024);
        assert_eq!(opts.chunk_size(Some(0)), 16 * 1024);
        assert_eq!(opts.chunk_size(Some(65_536)), 65_536);
        assert_eq!(opts.low_watermark(16 * 1024), 57_344);
    }
}
