//! webrtc-rs backend (feature `native`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kayo_core::{ConnectivityHint, NegotiationError, SdpKind, SessionDescription, TransportError};
use kayo_transport::{ChannelMessage, DataChannel};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::peer::{PeerConnection, PeerConnector, PeerEvent, PeerEventSender};

/// How often a waiting sender re-reads the buffered amount. The
/// low-threshold callback only fires on a downward crossing.
const DRAIN_RECHECK: Duration = Duration::from_millis(100);

fn platform(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Platform { reason: e.to_string() }
}

fn rejected(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Rejected { reason: e.to_string() }
}

// MARK: - Connector

pub struct NativeConnector {
    ice_servers: Vec<String>,
}

impl Default for NativeConnector {
    fn default() -> Self {
        Self { ice_servers: vec!["stun:stun.l.google.com:19302".into()] }
    }
}

impl NativeConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerConnector for NativeConnector {
    async fn connect(
        &self,
        remote: u64,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(platform)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(platform)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer { urls: self.ice_servers.clone(), ..Default::default() }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(platform)?);

        let hint_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            match candidate {
                None => {
                    let _ = hint_events.send(PeerEvent::LocalHint { peer: remote, hint: None });
                }
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let hint = ConnectivityHint {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        let _ = hint_events.send(PeerEvent::LocalHint { peer: remote, hint: Some(hint) });
                    }
                    Err(e) => warn!(peer = remote, error = %e, "Local candidate not serializable"),
                },
            }
            Box::pin(async {})
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(peer = remote, %state, "Peer connection state");
            if state == RTCPeerConnectionState::Failed {
                let _ = state_events.send(PeerEvent::Failed {
                    peer: remote,
                    reason: "connectivity checks failed".into(),
                });
            }
            Box::pin(async {})
        }));

        let channel_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            info!(peer = remote, label = dc.label(), "Remote data channel announced");
            wire(dc, remote, channel_events.clone());
            Box::pin(async {})
        }));

        Ok(Arc::new(NativePeer { remote, pc, events }))
    }
}

/// Route a data channel's callbacks into the event stream.
fn wire(dc: Arc<RTCDataChannel>, peer: u64, events: PeerEventSender) {
    let channel = Arc::new(NativeChannel::new(dc.clone()));

    let open_events = events.clone();
    let open_channel = channel.clone();
    dc.on_open(Box::new(move || {
        let _ = open_events.send(PeerEvent::ChannelOpened { peer, channel: open_channel });
        Box::pin(async {})
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let message = if msg.is_string {
            ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
        } else {
            ChannelMessage::Binary(msg.data)
        };
        let _ = message_events.send(PeerEvent::Message { peer, message });
        Box::pin(async {})
    }));

    let drained = channel.drained.clone();
    dc.on_close(Box::new(move || {
        drained.notify_waiters();
        let _ = events.send(PeerEvent::ChannelClosed { peer });
        Box::pin(async {})
    }));
}

// MARK: - PeerConnection

struct NativePeer {
    remote: u64,
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSender,
}

#[async_trait]
impl PeerConnection for NativePeer {
    async fn create_data_channel(&self, label: &str) -> Result<(), NegotiationError> {
        let init = RTCDataChannelInit { ordered: Some(true), ..Default::default() };
        let dc = self.pc.create_data_channel(label, Some(init)).await.map_err(platform)?;
        wire(dc, self.remote, self.events.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(platform)?;
        self.pc.set_local_description(offer.clone()).await.map_err(platform)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(platform)?;
        self.pc.set_local_description(answer.clone()).await.map_err(platform)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let remote = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpKind::Rollback => {
                return Err(NegotiationError::Rejected { reason: "rollback is not supported".into() })
            }
        }
        .map_err(rejected)?;
        self.pc.set_remote_description(remote).await.map_err(rejected)
    }

    async fn add_connectivity_hint(&self, hint: Option<ConnectivityHint>) -> Result<(), NegotiationError> {
        let Some(hint) = hint else {
            debug!(peer = self.remote, "Remote end of candidates");
            return Ok(());
        };
        let init = RTCIceCandidateInit {
            candidate: hint.candidate,
            sdp_mid: hint.sdp_mid,
            sdp_mline_index: hint.sdp_mline_index,
            username_fragment: hint.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(platform)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(peer = self.remote, error = %e, "Peer connection close failed");
        }
    }
}

// MARK: - DataChannel

/// [`DataChannel`] over an `RTCDataChannel`.
pub struct NativeChannel {
    dc: Arc<RTCDataChannel>,
    low_watermark: AtomicUsize,
    drained: Arc<Notify>,
}

impl NativeChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self { dc, low_watermark: AtomicUsize::new(0), drained: Arc::new(Notify::new()) }
    }
}

fn send_failed(e: webrtc::Error) -> TransportError {
    TransportError::SendFailed { reason: e.to_string() }
}

#[async_trait]
impl DataChannel for NativeChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    /// Not exposed by the SCTP transport here; senders use the fallback size.
    fn max_message_size(&self) -> Option<usize> {
        None
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.dc.send_text(text).await.map(|_| ()).map_err(send_failed)
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.dc.send(&data).await.map(|_| ()).map_err(send_failed)
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_low_watermark(&self, bytes: usize) {
        self.low_watermark.store(bytes, Ordering::Release);
        self.dc.set_buffered_amount_low_threshold(bytes).await;
        let drained = self.drained.clone();
        self.dc
            .on_buffered_amount_low(Box::new(move || {
                drained.notify_waiters();
                Box::pin(async {})
            }))
            .await;
    }

    async fn low_watermark_reached(&self) {
        loop {
            let notified = self.drained.notified();
            if !self.is_open()
                || self.dc.buffered_amount().await <= self.low_watermark.load(Ordering::Acquire)
            {
                return;
            }
            let _ = tokio::time::timeout(DRAIN_RECHECK, notified).await;
        }
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(error = %e, "Data channel close failed");
        }
        self.drained.notify_waiters();
    }
}
