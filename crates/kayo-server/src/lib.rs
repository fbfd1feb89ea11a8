//! kayo-server — the signaling relay.
//!
//! Clients connect over WebSocket with `?projectID=<key>`. Everyone with the
//! same key shares a [`Session`]; the first one in is the Leader. The server
//! never interprets offers or hints, it only routes them by participant id.

mod connection;
pub mod registry;
mod server;
pub mod session;
pub mod tls;

pub use connection::{session_key, SESSION_KEY_PARAM};
pub use registry::Registry;
pub use server::{ShutdownHandle, SignalingServer};
pub use session::{
    connection_queue, ConnectionHandle, ConnectionQueue, Outbound, Participant, Readiness, Session,
    OUTBOUND_QUEUE_FRAMES,
};
