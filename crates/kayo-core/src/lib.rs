pub mod config;
pub mod errors;
pub mod messages;
pub mod types;

pub use config::{ClientConfig, ServerConfig, TlsMode, TransferOptions};
pub use errors::{
    KayoError, NegotiationError, ProtocolError, RelayError, TransferError, TransportError,
};
pub use messages::{ChatMessage, ClientMessage, DataMessage, ServerMessage};
pub use types::*;
