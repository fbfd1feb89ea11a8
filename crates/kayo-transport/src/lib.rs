//! kayo-transport — bulk data over an established peer channel.
//!
//! ```text
//! sender                                         receiver
//! ──────                                         ────────
//! start of file (JSON text) ───────────────────► Reassembler::start
//! chunk ≤ max message size (binary) ──┐
//!   buffered > 3.5 × chunk? wait ◄────┘ ───────► Reassembler::push_chunk
//! end of file (JSON text) ─────────────────────► Reassembler::finish → ReceivedFile
//! ```
//!
//! The peer-connection backend supplies a [`DataChannel`]; everything in this
//! crate is written against that trait only.

use async_trait::async_trait;
use bytes::Bytes;
use kayo_core::{DataMessage, TransportError};

pub mod chunked;
pub mod memory;
pub mod multicast;
pub mod progress;
pub mod reassembly;

pub use chunked::{send_chunked, send_file, TransferReport};
pub use memory::MemoryChannel;
pub use multicast::{multicast_transfer, MulticastTransfer, PeerTarget};
pub use progress::{ProgressSink, ProgressSnapshot, ProgressTracker};
pub use reassembly::{InboundData, Reassembler, ReceivedFile};

/// Label every Kayo peer link uses for its data channel.
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

// MARK: - DataChannel trait

/// Message-oriented, ordered, reliable channel to one remote peer.
///
/// Implementations:
/// - [`MemoryChannel`] — in-process pair (tests, loopback links)
/// - the WebRTC backends in `kayo-webrtc`
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// `false` once either side closed the channel.
    fn is_open(&self) -> bool;

    /// Largest message the channel accepts, if the transport advertises it.
    fn max_message_size(&self) -> Option<usize>;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;

    /// Bytes queued locally and not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    async fn set_low_watermark(&self, bytes: usize);

    /// Resolves once the buffered amount is at or below the low-watermark, or
    /// the channel is closed.
    async fn low_watermark_reached(&self);

    async fn close(&self);
}

/// One inbound message as delivered by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serialize and send one control frame.
pub async fn send_control(
    channel: &dyn DataChannel,
    message: &DataMessage,
) -> Result<(), TransportError> {
    let json = message.to_json().map_err(|e| TransportError::SendFailed { reason: e.to_string() })?;
    channel.send_text(json).await
}
