//! In-process peer backend.
//!
//! Offers and answers are opaque `loopback:<uuid>` tokens that only mean
//! something to a [`LoopbackNetwork`] shared by both clients. Applying the
//! other side's token hands over one end of a [`MemoryChannel`] pair, which
//! makes the full signaling round trip testable without a WebRTC stack.
//!
//! ```text
//! offerer                        LoopbackNetwork                  answerer
//! create_offer ── token ───────► offers[token] = far end
//!                                       │
//!                                       └──────────────► set_remote(offer)
//!                                                        create_answer ──► ChannelOpened
//! set_remote(answer) ──► ChannelOpened
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use kayo_core::{ConnectivityHint, NegotiationError, SdpKind, SessionDescription};
use kayo_transport::{DataChannel, MemoryChannel};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::peer::{PeerConnection, PeerConnector, PeerEvent, PeerEventSender};

const TOKEN_PREFIX: &str = "loopback:";

/// Shared rendezvous for loopback offers.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    offers: Arc<Mutex<HashMap<String, Arc<MemoryChannel>>>>,
    max_message_size: Option<usize>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channels on this network advertise `max` as their message size limit.
    pub fn with_max_message_size(max: usize) -> Self {
        Self { max_message_size: Some(max), ..Self::default() }
    }

    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector { network: self.clone() }
    }

    /// Offers nobody has picked up yet.
    pub fn pending_offers(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<MemoryChannel>>> {
        self.offers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct LoopbackConnector {
    network: LoopbackNetwork,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(
        &self,
        remote: u64,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        debug!(remote, "Loopback peer connection created");
        Ok(Arc::new(LoopbackPeer {
            remote,
            network: self.network.clone(),
            events,
            state: Mutex::new(PeerState::default()),
        }))
    }
}

#[derive(Default)]
struct PeerState {
    label: Option<String>,
    /// Token of the offer this side created.
    local_offer: Option<String>,
    /// Token of the offer this side applied.
    remote_offer: Option<String>,
    channel: Option<Arc<MemoryChannel>>,
    closed: bool,
}

struct LoopbackPeer {
    remote: u64,
    network: LoopbackNetwork,
    events: PeerEventSender,
    state: Mutex<PeerState>,
}

impl LoopbackPeer {
    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(state: &PeerState) -> Result<(), NegotiationError> {
        if state.closed {
            return Err(NegotiationError::Platform { reason: "peer connection is closed".into() });
        }
        Ok(())
    }

    /// Same shape as a host candidate, then end-of-candidates.
    fn gather_hints(&self) {
        let host = ConnectivityHint {
            candidate: "candidate:1 1 udp 2122260223 127.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        for hint in [Some(host), None] {
            let _ = self.events.send(PeerEvent::LocalHint { peer: self.remote, hint });
        }
    }

    /// Announce the channel and pump its inbound messages into the event
    /// stream until it closes.
    fn open(&self, channel: Arc<MemoryChannel>) {
        let peer = self.remote;
        let events = self.events.clone();
        info!(peer, label = channel.label(), "Loopback channel open");
        let _ = events.send(PeerEvent::ChannelOpened { peer, channel: channel.clone() });

        tokio::spawn(async move {
            while let Some(message) = channel.recv().await {
                if events.send(PeerEvent::Message { peer, message }).is_err() {
                    return;
                }
            }
            let _ = events.send(PeerEvent::ChannelClosed { peer });
        });
    }
}

fn token_of(desc: &SessionDescription) -> Result<&str, NegotiationError> {
    desc.sdp.strip_prefix(TOKEN_PREFIX).ok_or_else(|| NegotiationError::Rejected {
        reason: format!("not a loopback description: {:?}", desc.sdp),
    })
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_data_channel(&self, label: &str) -> Result<(), NegotiationError> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        state.label = Some(label.to_owned());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let token = {
            let mut state = self.lock();
            Self::ensure_open(&state)?;
            let label = state.label.clone().ok_or_else(|| NegotiationError::Platform {
                reason: "offer without a data channel".into(),
            })?;

            let (near, far) = MemoryChannel::pair_with_max(&label, self.network.max_message_size);
            let token = Uuid::new_v4().to_string();
            if let Some(stale) = state.local_offer.replace(token.clone()) {
                self.network.lock().remove(&stale);
            }
            state.channel = Some(near);
            self.network.lock().insert(token.clone(), far);
            token
        };
        self.gather_hints();
        Ok(SessionDescription::offer(format!("{TOKEN_PREFIX}{token}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let (token, channel) = {
            let state = self.lock();
            Self::ensure_open(&state)?;
            match (&state.remote_offer, &state.channel) {
                (Some(token), Some(channel)) => (token.clone(), channel.clone()),
                _ => {
                    return Err(NegotiationError::Platform {
                        reason: "answer requested before an offer was applied".into(),
                    })
                }
            }
        };
        self.gather_hints();
        self.open(channel);
        Ok(SessionDescription::answer(format!("{TOKEN_PREFIX}{token}")))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let token = token_of(&desc)?.to_owned();
        match desc.kind {
            SdpKind::Offer => {
                let far = self.network.lock().remove(&token).ok_or_else(|| {
                    NegotiationError::Rejected { reason: format!("unknown loopback offer {token}") }
                })?;
                let stale = {
                    let mut state = self.lock();
                    Self::ensure_open(&state)?;
                    state.remote_offer = Some(token);
                    state.channel.replace(far)
                };
                if let Some(stale) = stale {
                    stale.close().await;
                }
                Ok(())
            }
            SdpKind::Answer => {
                let channel = {
                    let state = self.lock();
                    Self::ensure_open(&state)?;
                    if state.local_offer.as_deref() != Some(token.as_str()) {
                        return Err(NegotiationError::Rejected {
                            reason: format!("answer {token} does not match the local offer"),
                        });
                    }
                    state.channel.clone()
                };
                match channel {
                    Some(channel) => {
                        self.open(channel);
                        Ok(())
                    }
                    None => Err(NegotiationError::Platform { reason: "no local channel".into() }),
                }
            }
            SdpKind::Pranswer | SdpKind::Rollback => Err(NegotiationError::Rejected {
                reason: format!("{:?} is not supported by the loopback backend", desc.kind),
            }),
        }
    }

    async fn add_connectivity_hint(&self, hint: Option<ConnectivityHint>) -> Result<(), NegotiationError> {
        let state = self.lock();
        Self::ensure_open(&state)?;
        if state.remote_offer.is_none() && state.local_offer.is_none() {
            return Err(NegotiationError::Platform { reason: "remote description not set".into() });
        }
        match hint {
            Some(hint) => debug!(peer = self.remote, candidate = %hint.candidate, "Loopback hint applied"),
            None => debug!(peer = self.remote, "Remote end of candidates"),
        }
        Ok(())
    }

    async fn close(&self) {
        let (channel, offer) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.channel.take(), state.local_offer.take())
        };
        if let Some(token) = offer {
            if self.network.lock().remove(&token).is_some() {
                warn!(peer = self.remote, "Closed before the offer was answered");
            }
        }
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use kayo_transport::ChannelMessage;
    use tokio::sync::mpsc;

    use super::*;

    async fn next(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within 1s")
            .expect("sender alive")
    }

    async fn opened(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Arc<dyn DataChannel> {
        loop {
            if let PeerEvent::ChannelOpened { channel, .. } = next(rx).await {
                return channel;
            }
        }
    }

    #[tokio::test]
    async fn offer_answer_opens_both_ends() {
        let network = LoopbackNetwork::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = network.connector().connect(1, tx_a).await.unwrap();
        let b = network.connector().connect(0, tx_b).await.unwrap();

        a.create_data_channel("fileTransfer").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        assert!(offer.sdp.starts_with("loopback:"));
        assert_eq!(network.pending_offers(), 1);

        b.set_remote_description(offer).await.unwrap();
        assert_eq!(network.pending_offers(), 0);
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let chan_a = opened(&mut rx_a).await;
        let chan_b = opened(&mut rx_b).await;
        assert_eq!(chan_b.label(), "fileTransfer");

        chan_a.send_binary(Bytes::from_static(b"ping")).await.unwrap();
        loop {
            if let PeerEvent::Message { peer, message } = next(&mut rx_b).await {
                assert_eq!(peer, 0);
                assert_eq!(message, ChannelMessage::Binary(Bytes::from_static(b"ping")));
                break;
            }
        }
    }

    #[tokio::test]
    async fn hints_need_a_description_first() {
        let network = LoopbackNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = network.connector().connect(3, tx).await.unwrap();
        assert!(peer.add_connectivity_hint(None).await.is_err());

        peer.create_data_channel("fileTransfer").await.unwrap();
        peer.create_offer().await.unwrap();
        assert!(matches!(next(&mut rx).await, PeerEvent::LocalHint { peer: 3, hint: Some(_) }));
        assert!(matches!(next(&mut rx).await, PeerEvent::LocalHint { peer: 3, hint: None }));
        assert!(peer.add_connectivity_hint(None).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_foreign_and_mismatched_descriptions() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = network.connector().connect(1, tx).await.unwrap();

        let err = peer.set_remote_description(SessionDescription::offer("v=0")).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Rejected { .. }));

        let err = peer
            .set_remote_description(SessionDescription::offer("loopback:nobody"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Rejected { .. }));

        peer.create_data_channel("fileTransfer").await.unwrap();
        peer.create_offer().await.unwrap();
        let err = peer
            .set_remote_description(SessionDescription::answer("loopback:other"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Rejected { .. }));
    }

    #[tokio::test]
    async fn close_withdraws_offer_and_ends_the_pump() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let lonely = network.connector().connect(1, tx).await.unwrap();
        lonely.create_data_channel("fileTransfer").await.unwrap();
        lonely.create_offer().await.unwrap();
        lonely.close().await;
        assert_eq!(network.pending_offers(), 0);
        assert!(lonely.create_offer().await.is_err());

        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = network.connector().connect(1, tx_a).await.unwrap();
        let b = network.connector().connect(0, tx_b).await.unwrap();
        a.create_data_channel("fileTransfer").await.unwrap();
        b.set_remote_description(a.create_offer().await.unwrap()).await.unwrap();
        a.set_remote_description(b.create_answer().await.unwrap()).await.unwrap();

        a.close().await;
        loop {
            if let PeerEvent::ChannelClosed { peer } = next(&mut rx_b).await {
                assert_eq!(peer, 0);
                break;
            }
        }
    }
}
