//! One participant's WebSocket connection: handshake, dispatch, cleanup.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use kayo_core::messages::{FileInfo, RelayedHint, RelayedOffer};
use kayo_core::{ClientMessage, ProtocolError, RelayError, ServerMessage, TargetSelector};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::registry::Registry;
use crate::server::stopped;
use crate::session::{connection_queue, Outbound, Participant, Session, OUTBOUND_QUEUE_FRAMES};

/// Query parameter carrying the session key.
pub const SESSION_KEY_PARAM: &str = "projectID";

/// Session key from a request URI, `None` when missing or empty.
pub fn session_key(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == SESSION_KEY_PARAM)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn bad_request(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_owned()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

// MARK: - Serve

/// Run one connection to completion.
pub(crate) async fn serve<S>(
    stream: S,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
    ws_config: WebSocketConfig,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut key: Option<String> = None;
    let callback = |req: &Request, response: Response| match session_key(req.uri()) {
        Some(k) => {
            key = Some(k);
            Ok(response)
        }
        None => {
            warn!(%peer_addr, uri = %req.uri(), "Connection without {SESSION_KEY_PARAM}, rejected");
            Err(bad_request("missing projectID query parameter"))
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
        .await
    {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer_addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let Some(key) = key else { return };

    let (tx, mut queue) = connection_queue(OUTBOUND_QUEUE_FRAMES);
    let lagged = queue.lag_signal();
    let (session, participant) = match registry.join(&key, tx, Some(peer_addr.to_string())) {
        Ok(joined) => joined,
        Err(e) => {
            warn!(%peer_addr, session = %key, error = %e, "Join failed");
            return;
        }
    };

    let (mut sink, mut incoming) = ws.split();

    // Writer task: drains the participant's queue onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(out) = queue.recv().await {
            let result = match out {
                Outbound::Text(text) => sink.send(Message::Text(text)).await,
                Outbound::Binary(data) => sink.send(Message::Binary(data.to_vec())).await,
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = result {
                debug!(error = %e, "Socket write failed, writer stopping");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = Connection::new(session.clone(), participant.clone());
    let mut lagging = false;
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = lagged.notified() => {
                warn!(participant = %participant.identity, "Client not reading, disconnected");
                lagging = true;
                break;
            }
            frame = incoming.next() => match frame {
                Some(Ok(Message::Text(text))) => conn.on_text(&text),
                Some(Ok(Message::Binary(data))) => conn.on_binary(Bytes::from(data)),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(participant = %participant.identity, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    registry.leave(&session, participant.id());
    debug!(participant = %participant.identity, "Connection closed");
    if lagging {
        // Its socket write is stuck; the queued frames are never going out.
        writer.abort();
    }
    let _ = writer.await;
}

// MARK: - Dispatch

/// Per-connection dispatch state.
pub(crate) struct Connection {
    session: Arc<Session>,
    participant: Participant,
    /// Fan-out scope of the signaling-channel transfer in progress, if any.
    transfer_target: Option<TargetSelector>,
}

impl Connection {
    pub(crate) fn new(session: Arc<Session>, participant: Participant) -> Self {
        Self { session, participant, transfer_target: None }
    }

    pub(crate) fn on_text(&mut self, text: &str) {
        match ClientMessage::from_json(text) {
            Ok(msg) => {
                let kind = msg.kind();
                if let Err(e) = self.dispatch(msg) {
                    debug!(participant = %self.participant.identity, kind, error = %e, "Relay dropped");
                }
            }
            Err(ProtocolError::UnknownKind { kind }) => {
                warn!(participant = %self.participant.identity, kind, "Unknown message type, dropped");
            }
            Err(e) => {
                warn!(participant = %self.participant.identity, error = %e, "Malformed message, dropped");
            }
        }
    }

    pub(crate) fn on_binary(&mut self, data: Bytes) {
        let Some(target) = self.transfer_target else {
            warn!(
                participant = %self.participant.identity,
                bytes = data.len(),
                "Binary frame outside a transfer, dropped"
            );
            return;
        };
        if let Err(e) = self.session.relay_binary(data, target, self.participant.id()) {
            debug!(participant = %self.participant.identity, error = %e, "Binary relay dropped");
        }
    }

    fn dispatch(&mut self, msg: ClientMessage) -> Result<(), RelayError> {
        let me = self.participant.id();
        match msg {
            ClientMessage::Text(text) => {
                info!(participant = %self.participant.identity, "{text}");
            }
            ClientMessage::LeaderReady => {
                self.session.leader_ready(me)?;
            }
            ClientMessage::FollowerReady => {
                self.session.follower_ready(me)?;
            }
            ClientMessage::Offer(req) => {
                let target = req.target.id;
                let relayed = ServerMessage::Offer(RelayedOffer {
                    origin: self.participant.identity.clone(),
                    target: req.target,
                    offer: req.offer,
                });
                self.session.relay_to_identity(target, &relayed)?;
            }
            ClientMessage::IceCandidate(req) => {
                let target = req.target.id;
                let relayed = ServerMessage::IceCandidate(RelayedHint {
                    origin: self.participant.identity.clone(),
                    target: req.target,
                    candidate: req.candidate,
                });
                self.session.relay_to_identity(target, &relayed)?;
            }
            ClientMessage::StartOfFile(ann) => {
                self.transfer_target = Some(ann.target);
                let start = ServerMessage::StartOfFile(FileInfo { file_name: ann.file_name });
                self.session.relay_broadcast(ann.target, &start, me)?;
            }
            ClientMessage::EndOfFile(ann) => {
                let target = self.transfer_target.take().unwrap_or(ann.target);
                let end = ServerMessage::EndOfFile(FileInfo { file_name: ann.file_name });
                self.session.relay_broadcast(target, &end, me)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kayo_core::messages::{FileAnnouncement, OfferRequest};
    use kayo_core::{Identity, SessionDescription};
    use crate::session::ConnectionQueue;

    use super::*;

    fn setup() -> (Arc<Session>, Vec<(Participant, ConnectionQueue)>) {
        let session = Arc::new(Session::new("abc"));
        let members = (0..3)
            .map(|_| {
                let (tx, mut rx) = connection_queue(OUTBOUND_QUEUE_FRAMES);
                let participant = session.join(tx, None).unwrap();
                assert!(matches!(next_text(&mut rx), Some(ServerMessage::RoleAssignment(_))));
                (participant, rx)
            })
            .collect();
        (session, members)
    }

    fn next_text(rx: &mut ConnectionQueue) -> Option<ServerMessage> {
        match rx.try_recv().ok()? {
            Outbound::Text(t) => Some(ServerMessage::from_json(&t).unwrap()),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn parses_session_key() {
        let uri: Uri = "/?projectID=abc%20def&x=1".parse().unwrap();
        assert_eq!(session_key(&uri).as_deref(), Some("abc def"));
        assert_eq!(session_key(&"/?projectID=".parse().unwrap()), None);
        assert_eq!(session_key(&"/".parse().unwrap()), None);
    }

    #[test]
    fn offer_is_relayed_with_origin() {
        let (session, mut members) = setup();
        let mut leader = Connection::new(session, members[0].0.clone());
        let offer = ClientMessage::Offer(OfferRequest {
            target: Identity::with_id(1),
            offer: SessionDescription::offer("v=0"),
        });
        leader.on_text(&offer.to_json().unwrap());

        let Some(ServerMessage::Offer(relayed)) = next_text(&mut members[1].1) else {
            panic!("follower should get the offer");
        };
        assert_eq!(relayed.origin.id, 0);
        assert_eq!(relayed.target.id, 1);
        assert!(next_text(&mut members[2].1).is_none());
    }

    #[test]
    fn offer_to_unknown_identity_sends_nothing() {
        let (session, mut members) = setup();
        let mut leader = Connection::new(session, members[0].0.clone());
        let offer = ClientMessage::Offer(OfferRequest {
            target: Identity::with_id(999),
            offer: SessionDescription::offer("v=0"),
        });
        leader.on_text(&offer.to_json().unwrap());
        for (_, rx) in members.iter_mut() {
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn binary_follows_the_announced_target_until_end_of_file() {
        let (session, mut members) = setup();
        let mut sender = Connection::new(session, members[2].0.clone());

        sender.on_binary(Bytes::from_static(b"early"));
        assert!(members[0].1.try_recv().is_err());

        let ann = FileAnnouncement { target: TargetSelector::Leader, file_name: "f".into() };
        sender.on_text(&ClientMessage::StartOfFile(ann.clone()).to_json().unwrap());
        sender.on_binary(Bytes::from_static(b"chunk"));
        sender.on_text(&ClientMessage::EndOfFile(ann).to_json().unwrap());

        let leader = &mut members[0].1;
        assert!(matches!(next_text(leader), Some(ServerMessage::StartOfFile(_))));
        assert_eq!(leader.try_recv().ok(), Some(Outbound::Binary(Bytes::from_static(b"chunk"))));
        assert!(matches!(next_text(leader), Some(ServerMessage::EndOfFile(_))));
        assert!(members[1].1.try_recv().is_err());

        sender.on_binary(Bytes::from_static(b"late"));
        assert!(members[0].1.try_recv().is_err());
    }

    #[test]
    fn garbage_keeps_the_connection_usable() {
        let (session, mut members) = setup();
        let mut follower = Connection::new(session, members[1].0.clone());
        follower.on_text("{not json");
        follower.on_text(r#"{"type":"teleport","content":{}}"#);

        follower.on_text(&ClientMessage::LeaderReady.to_json().unwrap());
        assert!(members[0].1.try_recv().is_err(), "non-leader readiness is ignored");
    }
}
