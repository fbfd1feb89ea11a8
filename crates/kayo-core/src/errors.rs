use thiserror::Error;

#[derive(Error, Debug)]
pub enum KayoError {
    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("TLS setup failed: {reason}")]
    Tls { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while relaying inside a session. Always logged and dropped by
/// the server, never fatal to the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Identity id {id} unknown")]
    UnknownTarget { id: u64 },

    #[error("No leader")]
    NoLeader,

    #[error("Session {key} is closed")]
    SessionClosed { key: String },

    #[error("Participant {id} connection is gone")]
    ConnectionGone { id: u64 },

    #[error("Participant {id} is not reading, disconnected")]
    Lagging { id: u64 },

    #[error("Could not encode relay frame: {reason}")]
    Encode { reason: String },
}

/// A received frame the dispatcher cannot act on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {reason}")]
    Malformed { reason: String },

    #[error("Unknown message type: {kind}")]
    UnknownKind { kind: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },
}

/// The connection-establishment primitive rejected a step, or the step
/// referred to a peer this role does not know.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Remote description rejected: {reason}")]
    Rejected { reason: String },

    #[error("Unknown peer {id}")]
    UnknownPeer { id: u64 },

    #[error("Peer connection error: {reason}")]
    Platform { reason: String },

    #[error("Negotiation with peer {id} stalled for {ms}ms")]
    TimedOut { id: u64, ms: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Channel closed after {sent} of {total} bytes")]
    ChannelClosed { sent: u64, total: u64 },

    #[error("No low-watermark signal for {ms}ms after {sent} bytes")]
    Stalled { sent: u64, ms: u64 },

    #[error("Send failed: {0}")]
    Send(#[from] TransportError),

    #[error("Transfer aborted")]
    Aborted,
}
