use bytes::{Bytes, BytesMut};
use kayo_core::ServerMessage;
use tracing::{debug, warn};

use crate::client::SignalingEvent;

/// A file that arrived over the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingFile {
    pub name: String,
    pub data: Bytes,
}

/// Reassembles signaling-channel transfers.
///
/// Server-to-client frames carry no sender, so only one transfer can be open
/// per connection. A new start discards whatever was pending.
#[derive(Default)]
pub struct SignalingFileAssembler {
    pending: Option<(String, BytesMut)>,
}

impl SignalingFileAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_receiving(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed one event. Returns the file when its end marker arrives; events
    /// that are not part of a transfer are ignored.
    pub fn on_event(&mut self, event: &SignalingEvent) -> Option<SignalingFile> {
        match event {
            SignalingEvent::Message(ServerMessage::StartOfFile(info)) => {
                if let Some((stale, buf)) = self.pending.take() {
                    warn!(file = %stale, bytes = buf.len(), "New transfer started, partial file dropped");
                }
                debug!(file = %info.file_name, "Receiving file over signaling");
                self.pending = Some((info.file_name.clone(), BytesMut::new()));
                None
            }
            SignalingEvent::Binary(chunk) => {
                match self.pending.as_mut() {
                    Some((_, buf)) => buf.extend_from_slice(chunk),
                    None => warn!(bytes = chunk.len(), "Binary frame outside a transfer, dropped"),
                }
                None
            }
            SignalingEvent::Message(ServerMessage::EndOfFile(info)) => {
                let Some((name, buf)) = self.pending.take() else {
                    warn!(file = %info.file_name, "End of file without a start, ignored");
                    return None;
                };
                if name != info.file_name {
                    warn!(started = %name, ended = %info.file_name, "File name mismatch at end of file");
                }
                Some(SignalingFile { name, data: buf.freeze() })
            }
            SignalingEvent::Closed => {
                if let Some((name, buf)) = self.pending.take() {
                    warn!(file = %name, bytes = buf.len(), "Connection closed mid-transfer");
                }
                None
            }
            SignalingEvent::Message(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use kayo_core::messages::FileInfo;

    use super::*;

    fn start(name: &str) -> SignalingEvent {
        SignalingEvent::Message(ServerMessage::StartOfFile(FileInfo { file_name: name.into() }))
    }

    fn end(name: &str) -> SignalingEvent {
        SignalingEvent::Message(ServerMessage::EndOfFile(FileInfo { file_name: name.into() }))
    }

    #[test]
    fn collects_chunks_between_markers() {
        let mut a = SignalingFileAssembler::new();
        assert!(a.on_event(&start("a.txt")).is_none());
        assert!(a.is_receiving());
        a.on_event(&SignalingEvent::Binary(Bytes::from_static(b"ab")));
        a.on_event(&SignalingEvent::Binary(Bytes::from_static(b"cd")));

        let file = a.on_event(&end("a.txt")).unwrap();
        assert_eq!(file, SignalingFile { name: "a.txt".into(), data: Bytes::from_static(b"abcd") });
        assert!(!a.is_receiving());
    }

    #[test]
    fn stray_frames_are_ignored() {
        let mut a = SignalingFileAssembler::new();
        assert!(a.on_event(&SignalingEvent::Binary(Bytes::from_static(b"x"))).is_none());
        assert!(a.on_event(&end("nope")).is_none());
        assert!(a.on_event(&SignalingEvent::Message(ServerMessage::Text("hi".into()))).is_none());
    }

    #[test]
    fn restart_and_close_drop_partial_data() {
        let mut a = SignalingFileAssembler::new();
        a.on_event(&start("one"));
        a.on_event(&SignalingEvent::Binary(Bytes::from_static(b"old")));
        a.on_event(&start("two"));
        let file = a.on_event(&end("two")).unwrap();
        assert!(file.data.is_empty());

        a.on_event(&start("three"));
        a.on_event(&SignalingEvent::Closed);
        assert!(!a.is_receiving());
    }
}
