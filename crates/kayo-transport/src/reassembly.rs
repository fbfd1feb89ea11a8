//! Receiver side of the chunked protocol.
//!
//! State is kept per sending peer, so interleaved transfers from different
//! peers never mix. Chunks that arrive outside a start/end pair are dropped.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use kayo_core::{ChatMessage, DataMessage};
use tracing::{debug, warn};

use crate::ChannelMessage;

/// A completely reassembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub from: u64,
    pub name: String,
    pub data: Bytes,
    pub chunks: u64,
}

/// What a data-channel message amounted to, once interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundData {
    /// A chat line from the peer the frame came in on.
    Chat { from: u64, text: String },
    File(ReceivedFile),
}

struct PendingFile {
    name: String,
    buffer: BytesMut,
    chunks: u64,
}

#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<u64, PendingFile>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a file from `from`. A transfer already in progress from the same
    /// peer is discarded.
    pub fn start(&mut self, from: u64, name: impl Into<String>) {
        let name = name.into();
        if let Some(old) = self.pending.insert(
            from,
            PendingFile { name: name.clone(), buffer: BytesMut::new(), chunks: 0 },
        ) {
            warn!(from, dropped = %old.name, bytes = old.buffer.len(), "Restarted transfer, partial file dropped");
        }
        debug!(from, file = %name, "Receiving file");
    }

    /// Append one chunk. Returns `false` when no transfer is open for `from`.
    pub fn push_chunk(&mut self, from: u64, chunk: &[u8]) -> bool {
        match self.pending.get_mut(&from) {
            Some(file) => {
                file.buffer.extend_from_slice(chunk);
                file.chunks += 1;
                true
            }
            None => {
                warn!(from, bytes = chunk.len(), "Chunk outside a transfer, dropped");
                false
            }
        }
    }

    /// Close the transfer from `from` and hand out the file.
    pub fn finish(&mut self, from: u64) -> Option<ReceivedFile> {
        let file = self.pending.remove(&from)?;
        Some(ReceivedFile { from, name: file.name, data: file.buffer.freeze(), chunks: file.chunks })
    }

    /// Drop any partial state for a peer whose channel went away.
    pub fn forget(&mut self, from: u64) {
        if let Some(file) = self.pending.remove(&from) {
            debug!(from, file = %file.name, bytes = file.buffer.len(), "Partial file discarded");
        }
    }

    /// `(file name, bytes so far)` of the transfer open for `from`.
    pub fn in_progress(&self, from: u64) -> Option<(&str, usize)> {
        self.pending.get(&from).map(|f| (f.name.as_str(), f.buffer.len()))
    }

    /// Feed one raw channel message.
    pub fn on_message(&mut self, from: u64, message: ChannelMessage) -> Option<InboundData> {
        match message {
            ChannelMessage::Binary(chunk) => {
                self.push_chunk(from, &chunk);
                None
            }
            ChannelMessage::Text(text) => match DataMessage::from_json(&text) {
                Ok(DataMessage::StartOfFile(name)) => {
                    self.start(from, name);
                    None
                }
                Ok(DataMessage::EndOfFile) => {
                    let file = self.finish(from);
                    if file.is_none() {
                        warn!(from, "End of file without a start, ignored");
                    }
                    file.map(InboundData::File)
                }
                Ok(DataMessage::Text(body)) => Some(chat_line(from, body)),
                Err(e) => {
                    warn!(from, error = %e, "Unreadable data channel frame");
                    None
                }
            },
        }
    }
}

/// The channel decides who spoke; the payload's `sender` is only checked.
fn chat_line(from: u64, body: String) -> InboundData {
    match serde_json::from_str::<ChatMessage>(&body) {
        Ok(chat) => {
            if chat.sender != from {
                warn!(from, claimed = chat.sender, "Chat sender does not match the channel peer");
            }
            InboundData::Chat { from, text: chat.text }
        }
        Err(_) => InboundData::Chat { from, text: body },
    }
}
