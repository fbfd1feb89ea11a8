//! kayo-webrtc — peer links for a collaboration session.
//!
//! The Leader of a session negotiates one peer link per Follower through the
//! signaling server; Followers link only to the Leader. The connection
//! primitive itself sits behind [`PeerConnector`]:
//!
//! - [`LoopbackNetwork`] — in-process, backed by memory channels
//! - `NativeConnector` — webrtc-rs, behind the `native` feature

pub mod client;
pub mod loopback;
#[cfg(feature = "native")]
pub mod native;
pub mod peer;
pub mod role;

pub use client::{Client, ClientEvent};
pub use loopback::{LoopbackConnector, LoopbackNetwork};
#[cfg(feature = "native")]
pub use native::{NativeChannel, NativeConnector};
pub use peer::{PeerConnection, PeerConnector, PeerEvent, PeerEventSender, SignalSink};
pub use role::{Follower, Leader, LinkUpdate, Role};
