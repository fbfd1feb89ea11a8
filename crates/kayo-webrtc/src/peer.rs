//! Seam between the role protocol and a connection-establishment backend.
//!
//! A backend turns offers, answers and connectivity hints into an open
//! [`DataChannel`]. Everything it observes asynchronously (local hints, the
//! channel opening, inbound messages, failures) comes back as [`PeerEvent`]s
//! on the sender handed to [`PeerConnector::connect`].

use std::sync::Arc;

use async_trait::async_trait;
use kayo_core::{ClientMessage, ConnectivityHint, NegotiationError, SessionDescription, TransportError};
use kayo_signaling::SignalingWriter;
use kayo_transport::{ChannelMessage, DataChannel};
use tokio::sync::mpsc;

/// Something a backend observed about the link to `peer`.
#[derive(Clone)]
pub enum PeerEvent {
    /// A local connectivity hint to forward to the remote side. `None` marks
    /// the end of gathering.
    LocalHint { peer: u64, hint: Option<ConnectivityHint> },
    ChannelOpened { peer: u64, channel: Arc<dyn DataChannel> },
    Message { peer: u64, message: ChannelMessage },
    ChannelClosed { peer: u64 },
    Failed { peer: u64, reason: String },
}

impl PeerEvent {
    pub fn peer(&self) -> u64 {
        match self {
            Self::LocalHint { peer, .. }
            | Self::ChannelOpened { peer, .. }
            | Self::Message { peer, .. }
            | Self::ChannelClosed { peer }
            | Self::Failed { peer, .. } => *peer,
        }
    }
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalHint { peer, hint } => {
                f.debug_struct("LocalHint").field("peer", peer).field("hint", hint).finish()
            }
            Self::ChannelOpened { peer, channel } => f
                .debug_struct("ChannelOpened")
                .field("peer", peer)
                .field("label", &channel.label())
                .finish(),
            Self::Message { peer, message } => f
                .debug_struct("Message")
                .field("peer", peer)
                .field("bytes", &message.len())
                .finish(),
            Self::ChannelClosed { peer } => f.debug_struct("ChannelClosed").field("peer", peer).finish(),
            Self::Failed { peer, reason } => {
                f.debug_struct("Failed").field("peer", peer).field("reason", reason).finish()
            }
        }
    }
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

// MARK: - Backend traits

/// Creates one peer connection per remote participant.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        remote: u64,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

/// One connection-establishment primitive instance.
///
/// `create_offer` and `create_answer` also install the result as the local
/// description, so the backend may start emitting [`PeerEvent::LocalHint`]s
/// right after either returns.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Offering side only. The answering side learns about the channel via
    /// [`PeerEvent::ChannelOpened`].
    async fn create_data_channel(&self, label: &str) -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    /// `None` is the remote end-of-candidates marker.
    async fn add_connectivity_hint(&self, hint: Option<ConnectivityHint>) -> Result<(), NegotiationError>;

    async fn close(&self);
}

// MARK: - SignalSink

/// Outbound half of the signaling channel as the role protocol sees it.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, message: &ClientMessage) -> Result<(), TransportError>;
}

impl SignalSink for SignalingWriter {
    fn send_signal(&self, message: &ClientMessage) -> Result<(), TransportError> {
        self.send(message)
    }
}

impl SignalSink for mpsc::UnboundedSender<ClientMessage> {
    fn send_signal(&self, message: &ClientMessage) -> Result<(), TransportError> {
        self.send(message.clone()).map_err(|_| TransportError::ConnectionClosed)
    }
}
