//! WebSocket signaling **client**.
//!
//! # Lifecycle
//!
//! ```text
//! 1. SignalingClient::connect(url, session_key)
//!       └─ first event is always `role assignment`
//! 2. let (writer, events) = client.split()
//!       ├─ writer: SignalingWriter (Clone) for offers, hints, readiness, files
//!       └─ events: SignalingEvent stream from the server
//! 3. writer.close()
//! ```

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use kayo_core::config::{DEFAULT_MAX_MESSAGE_SIZE, SIGNALING_CHUNK_SIZE};
use kayo_core::messages::FileAnnouncement;
use kayo_core::{ClientMessage, ServerMessage, TargetSelector, TransferError, TransportError};
use kayo_transport::ProgressSink;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::tls::{self, CertPin, ServerTrust};

/// Inbound traffic from the signaling server.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Message(ServerMessage),
    Binary(Bytes),
    Closed,
}

#[derive(Debug)]
enum Outgoing {
    Text(String),
    /// The sender fires once the frame is on the socket.
    Binary(Bytes, oneshot::Sender<()>),
    Close,
}

/// Build the connect URL: `server_url` plus the `projectID` query parameter.
pub fn session_url(server_url: &str, session_key: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(server_url).map_err(|e| TransportError::SendFailed {
        reason: format!("invalid server url {server_url:?}: {e}"),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(TransportError::SendFailed {
            reason: format!("server url must be ws:// or wss://, got {server_url:?}"),
        });
    }
    url.query_pairs_mut().append_pair("projectID", session_key);
    Ok(url)
}

// ── SignalingClient ──────────────────────────────────────────────────────────

pub struct SignalingClient {
    writer: SignalingWriter,
    events: mpsc::UnboundedReceiver<SignalingEvent>,
}

impl SignalingClient {
    /// Connect to `server_url` (`ws://` or `wss://`) and join `session_key`.
    pub async fn connect(server_url: &str, session_key: &str) -> Result<Self, TransportError> {
        Self::connect_with_pin(server_url, session_key, CertPin::new()).await
    }

    /// Like [`connect`](Self::connect), reusing a certificate pinned by an
    /// earlier connection.
    pub async fn connect_with_pin(
        server_url: &str,
        session_key: &str,
        pin: CertPin,
    ) -> Result<Self, TransportError> {
        Self::connect_with_trust(server_url, session_key, ServerTrust::FirstUse(pin)).await
    }

    /// Connect checking a `wss://` certificate per `trust`. Ignored for `ws://`.
    pub async fn connect_with_trust(
        server_url: &str,
        session_key: &str,
        trust: ServerTrust,
    ) -> Result<Self, TransportError> {
        let url = session_url(server_url, session_key)?;
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::SendFailed { reason: "server url has no host".into() })?
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(80);

        let tcp = TcpStream::connect((host.as_str(), port)).await.map_err(|e| {
            TransportError::SendFailed { reason: format!("TCP connect to {host}:{port}: {e}") }
        })?;
        let _ = tcp.set_nodelay(true);

        let client = if url.scheme() == "wss" {
            let stream = tls::connect(&host, tcp, trust).await?;
            Self::handshake(&url, stream).await?
        } else {
            Self::handshake(&url, tcp).await?
        };

        info!(server = %host, port, session = session_key, "Signaling connected");
        Ok(client)
    }

    async fn handshake<S>(url: &Url, stream: S) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(DEFAULT_MAX_MESSAGE_SIZE);
        config.max_frame_size = Some(DEFAULT_MAX_MESSAGE_SIZE);

        let (ws, _response) =
            tokio_tungstenite::client_async_with_config(url.as_str(), stream, Some(config))
                .await
                .map_err(|e| TransportError::SendFailed { reason: format!("handshake: {e}") })?;
        Ok(Self::start(ws))
    }

    fn start<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (sink, stream) = ws.split();

        tokio::spawn(write_loop(sink, out_rx));
        tokio::spawn(recv_loop(stream, event_tx));

        Self { writer: SignalingWriter { tx: out_tx }, events: event_rx }
    }

    pub fn writer(&self) -> &SignalingWriter {
        &self.writer
    }

    /// `None` once the connection is gone and every event was read.
    pub async fn next_event(&mut self) -> Option<SignalingEvent> {
        self.events.recv().await
    }

    pub fn split(self) -> (SignalingWriter, mpsc::UnboundedReceiver<SignalingEvent>) {
        (self.writer, self.events)
    }
}

// ── Background loops ─────────────────────────────────────────────────────────

async fn write_loop<S>(
    mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(out) = rx.recv().await {
        let (result, ack) = match out {
            Outgoing::Text(text) => (sink.send(Message::Text(text)).await, None),
            Outgoing::Binary(data, ack) => (sink.send(Message::Binary(data.to_vec())).await, Some(ack)),
            Outgoing::Close => break,
        };
        if let Err(e) = result {
            warn!(error = %e, "Signaling write failed");
            break;
        }
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
    let _ = sink.close().await;
}

async fn recv_loop<S>(
    mut stream: futures_util::stream::SplitStream<WebSocketStream<S>>,
    events: mpsc::UnboundedSender<SignalingEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = stream.next().await {
        let event = match frame {
            Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                Ok(msg) => SignalingEvent::Message(msg),
                Err(e) => {
                    warn!(error = %e, "Unreadable signaling frame, skipped");
                    continue;
                }
            },
            Ok(Message::Binary(data)) => SignalingEvent::Binary(Bytes::from(data)),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "Signaling receive error");
                break;
            }
        };
        if events.send(event).is_err() {
            debug!("Event receiver dropped, stopping recv loop");
            return;
        }
    }
    let _ = events.send(SignalingEvent::Closed);
}

// ── SignalingWriter ──────────────────────────────────────────────────────────

/// Write handle to the signaling connection. Cheap to clone; every clone
/// feeds the same writer task.
#[derive(Clone)]
pub struct SignalingWriter {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl SignalingWriter {
    fn push(&self, out: Outgoing) -> Result<(), TransportError> {
        self.tx.send(out).map_err(|_| TransportError::ConnectionClosed)
    }

    pub fn send(&self, msg: &ClientMessage) -> Result<(), TransportError> {
        let json = msg.to_json().map_err(|e| TransportError::SendFailed { reason: e.to_string() })?;
        self.push(Outgoing::Text(json))
    }

    /// Queue a binary frame and wait until it was written to the socket.
    async fn write_binary(&self, data: Bytes) -> Result<(), TransportError> {
        let (ack, written) = oneshot::channel();
        self.push(Outgoing::Binary(data, ack))?;
        written.await.map_err(|_| TransportError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Close the connection after everything already queued went out.
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }

    /// Send a file through the server instead of a peer channel.
    ///
    /// The server fans the frames out per `target`. Each chunk is written
    /// before the next one is queued, so other signaling traffic interleaves
    /// with a large file. Returns the number of binary chunks written.
    pub async fn send_file(
        &self,
        name: &str,
        target: TargetSelector,
        payload: &Bytes,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<u64, TransferError> {
        let total = payload.len() as u64;
        let announcement = FileAnnouncement { target, file_name: name.to_owned() };
        self.send(&ClientMessage::StartOfFile(announcement.clone()))
            .map_err(|_| TransferError::ChannelClosed { sent: 0, total })?;

        let mut chunks = 0u64;
        let mut offset = 0usize;
        while offset < payload.len() {
            let end = (offset + SIGNALING_CHUNK_SIZE).min(payload.len());
            self.write_binary(payload.slice(offset..end))
                .await
                .map_err(|_| TransferError::ChannelClosed { sent: offset as u64, total })?;
            offset = end;
            chunks += 1;
            if let Some(sink) = progress {
                sink.on_progress(0, offset as u64, total);
            }
        }

        self.send(&ClientMessage::EndOfFile(announcement))
            .map_err(|_| TransferError::ChannelClosed { sent: total, total })?;
        if let Some(sink) = progress {
            sink.on_complete(0, total);
        }
        info!(file = name, bytes = total, chunks, ?target, "File sent on signaling channel");
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_goes_into_the_query() {
        let url = session_url("ws://127.0.0.1:3000", "my project").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:3000/?projectID=my+project");
        assert_eq!(url.port_or_known_default(), Some(3000));
    }

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(session_url("http://localhost", "k").is_err());
        assert!(session_url("not a url", "k").is_err());
    }

    #[test]
    fn wss_defaults_to_443() {
        let url = session_url("wss://kayo.example", "k").unwrap();
        assert_eq!(url.port_or_known_default(), Some(443));
    }

    #[tokio::test]
    async fn writer_reports_closed_connection() {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = SignalingWriter { tx };
        drop(rx);
        assert!(writer.is_closed());
        assert_eq!(writer.send(&ClientMessage::LeaderReady), Err(TransportError::ConnectionClosed));
        let err = writer
            .send_file("f", TargetSelector::All, &Bytes::from_static(b"x"), None)
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::ChannelClosed { sent: 0, total: 1 });
    }

    /// Stand-in for the socket writer: records frames and acknowledges chunks.
    fn fake_socket() -> (SignalingWriter, tokio::task::JoinHandle<Vec<String>>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let socket = tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(out) = rx.recv().await {
                match out {
                    Outgoing::Text(text) => frames.push(text),
                    Outgoing::Binary(data, ack) => {
                        frames.push(format!("binary {}", data.len()));
                        let _ = ack.send(());
                    }
                    Outgoing::Close => break,
                }
            }
            frames
        });
        (SignalingWriter { tx }, socket)
    }

    #[tokio::test]
    async fn large_file_is_split_at_16_mib() {
        let (writer, socket) = fake_socket();
        let payload = Bytes::from(vec![0u8; SIGNALING_CHUNK_SIZE + 10]);
        assert_eq!(writer.send_file("big", TargetSelector::Leader, &payload, None).await, Ok(2));
        writer.close();

        let frames = socket.await.unwrap();
        let binary: Vec<&str> = frames.iter().filter(|f| f.starts_with("binary")).map(String::as_str).collect();
        assert_eq!(binary, vec![format!("binary {SIGNALING_CHUNK_SIZE}").as_str(), "binary 10"]);
    }

    #[tokio::test]
    async fn each_chunk_waits_for_the_socket() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer = SignalingWriter { tx };
        let payload = Bytes::from(vec![1u8; SIGNALING_CHUNK_SIZE * 2]);
        let sender = writer.clone();
        let send = tokio::spawn(async move {
            sender.send_file("paced", TargetSelector::All, &payload, None).await
        });

        assert!(matches!(rx.recv().await, Some(Outgoing::Text(_))));
        let Some(Outgoing::Binary(_, ack)) = rx.recv().await else {
            panic!("first chunk expected");
        };
        // Nothing else is queued until the first chunk is written.
        writer.send(&ClientMessage::LeaderReady).unwrap();
        assert!(matches!(rx.recv().await, Some(Outgoing::Text(t)) if t.contains("leader ready")));
        assert!(rx.try_recv().is_err());

        ack.send(()).unwrap();
        let Some(Outgoing::Binary(_, second)) = rx.recv().await else {
            panic!("second chunk expected");
        };
        drop(second);
        assert_eq!(
            send.await.unwrap(),
            Err(TransferError::ChannelClosed { sent: SIGNALING_CHUNK_SIZE as u64, total: 2 * SIGNALING_CHUNK_SIZE as u64 })
        );
    }
}
