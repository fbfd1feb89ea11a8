//! Wire messages for the signaling channel and the peer data channel.
//!
//! Every text frame is a JSON object `{ "type": <kind>, "content": <payload> }`.
//! The kind strings are shared with the browser client, so they keep their
//! spaced spelling (`"ice candidate"`, `"start of file"`, ...).
//!
//! # Signaling flow
//!
//! ```text
//! client                          server                          client
//! ──────                          ──────                          ──────
//!                                 ◄── connect ?projectID=abc ──── Follower
//!                                 ─── role assignment ──────────►
//!                                 ◄── follower ready ───────────
//! Leader ◄── new follower ───────
//! Leader ─── offer {target} ────► ─── offer {origin,target} ────►
//!        ◄── offer {origin,..} ── ◄── offer (answer) {target} ──
//!        ◄─► ice candidate ◄────► ◄─► ice candidate ◄──────────►
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::types::{ConnectivityHint, Identity, Role, SessionDescription, TargetSelector};

// MARK: - Client → server

/// Messages a client sends to the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum ClientMessage {
    /// Free-form debug text, logged by the server.
    #[serde(rename = "string")]
    Text(String),

    #[serde(rename = "leader ready")]
    LeaderReady,

    #[serde(rename = "follower ready")]
    FollowerReady,

    /// Offer or answer addressed to one participant.
    #[serde(rename = "offer")]
    Offer(OfferRequest),

    #[serde(rename = "ice candidate")]
    IceCandidate(HintRequest),

    #[serde(rename = "start of file")]
    StartOfFile(FileAnnouncement),

    #[serde(rename = "end of file")]
    EndOfFile(FileAnnouncement),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferRequest {
    #[serde(rename = "targetIdentity")]
    pub target: Identity,
    pub offer: SessionDescription,
}

/// `candidate: null` signals end-of-candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HintRequest {
    #[serde(rename = "targetIdentity")]
    pub target: Identity,
    pub candidate: Option<ConnectivityHint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAnnouncement {
    pub target: TargetSelector,
    #[serde(rename = "fileName")]
    pub file_name: String,
}

const CLIENT_KINDS: &[&str] = &[
    "string",
    "leader ready",
    "follower ready",
    "offer",
    "ice candidate",
    "start of file",
    "end of file",
];

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "string",
            Self::LeaderReady => "leader ready",
            Self::FollowerReady => "follower ready",
            Self::Offer(_) => "offer",
            Self::IceCandidate(_) => "ice candidate",
            Self::StartOfFile(_) => "start of file",
            Self::EndOfFile(_) => "end of file",
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        parse_tagged(text, CLIENT_KINDS)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed { reason: e.to_string() })
    }
}

// MARK: - Server → client

/// Messages the signaling server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum ServerMessage {
    #[serde(rename = "string")]
    Text(String),

    #[serde(rename = "role assignment")]
    RoleAssignment(RoleAssignment),

    /// Sent to the Leader once a Follower is ready to receive an offer.
    #[serde(rename = "new follower")]
    NewFollower(Identity),

    #[serde(rename = "offer")]
    Offer(RelayedOffer),

    #[serde(rename = "ice candidate")]
    IceCandidate(RelayedHint),

    #[serde(rename = "start of file")]
    StartOfFile(FileInfo),

    #[serde(rename = "end of file")]
    EndOfFile(FileInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role: Role,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedOffer {
    #[serde(rename = "originIdentity")]
    pub origin: Identity,
    #[serde(rename = "targetIdentity")]
    pub target: Identity,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedHint {
    #[serde(rename = "originIdentity")]
    pub origin: Identity,
    #[serde(rename = "targetIdentity")]
    pub target: Identity,
    pub candidate: Option<ConnectivityHint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "fileName")]
    pub file_name: String,
}

const SERVER_KINDS: &[&str] = &[
    "string",
    "role assignment",
    "new follower",
    "offer",
    "ice candidate",
    "start of file",
    "end of file",
];

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "string",
            Self::RoleAssignment(_) => "role assignment",
            Self::NewFollower(_) => "new follower",
            Self::Offer(_) => "offer",
            Self::IceCandidate(_) => "ice candidate",
            Self::StartOfFile(_) => "start of file",
            Self::EndOfFile(_) => "end of file",
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        parse_tagged(text, SERVER_KINDS)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed { reason: e.to_string() })
    }
}

// MARK: - Data channel

/// Control frames on an established peer data channel. Payload chunks travel
/// as raw binary messages between `StartOfFile` and `EndOfFile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum DataMessage {
    #[serde(rename = "string")]
    Text(String),

    #[serde(rename = "start of file")]
    StartOfFile(String),

    #[serde(rename = "end of file")]
    EndOfFile,
}

const DATA_KINDS: &[&str] = &["string", "start of file", "end of file"];

impl DataMessage {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        parse_tagged(text, DATA_KINDS)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed { reason: e.to_string() })
    }
}

/// Chat line carried inside a `DataMessage::Text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    pub sender: u64,
}

// ── Shared parsing ───────────────────────────────────────────────────────────

/// Parse a tagged frame, telling an unknown `type` apart from a malformed
/// body so the caller can log the right thing.
fn parse_tagged<T: serde::de::DeserializeOwned>(
    text: &str,
    known: &[&str],
) -> Result<T, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::Malformed { reason: e.to_string() })?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProtocolError::Malformed { reason: "missing \"type\"".into() })?;

    if !known.contains(&kind) {
        return Err(ProtocolError::UnknownKind { kind: kind.to_owned() });
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed { reason: e.to_string() })
}
