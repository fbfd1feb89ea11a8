//! kayo-signaling — client side of the signaling channel.
//!
//! Carries offers, connectivity hints and readiness between a client and the
//! signaling server, plus the fallback file path that goes through the server
//! when no peer channel is available.

mod assembler;
mod client;
mod tls;

pub use assembler::{SignalingFile, SignalingFileAssembler};
pub use client::{session_url, SignalingClient, SignalingEvent, SignalingWriter};
pub use kayo_core::config::SIGNALING_CHUNK_SIZE;
pub use tls::{CertPin, ServerTrust};
