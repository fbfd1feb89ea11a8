use serde::{Deserialize, Serialize};

// MARK: - Identity

/// Identity of one participant inside a session.
///
/// The `id` is allocated by the session at join time and never reused while
/// the session lives. `origin` is the remote address of the participant's
/// signaling connection, when known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: u64,
    #[serde(default)]
    pub origin: Option<String>,
}

impl Identity {
    pub fn new(id: u64, origin: Option<String>) -> Self {
        Self { id, origin }
    }

    /// Identity known only by id (e.g. a relay target).
    pub fn with_id(id: u64) -> Self {
        Self { id, origin: None }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "#{} ({})", self.id, origin),
            None => write!(f, "#{}", self.id),
        }
    }
}

// MARK: - Role

/// Role of a participant in the star topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leader => write!(f, "Leader"),
            Self::Follower => write!(f, "Follower"),
        }
    }
}

// MARK: - TargetSelector

/// Fan-out scope for signaling-channel file transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetSelector {
    Leader,
    All,
    #[serde(rename = "All but Me")]
    AllButSender,
}

// MARK: - SessionDescription

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Offer/answer blob produced by the connection-establishment primitive.
///
/// Serialized the way browsers serialize `RTCSessionDescription`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }
}

// MARK: - ConnectivityHint

/// One ICE candidate, in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityHint {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl ConnectivityHint {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// MARK: - NegotiationState

/// Per-remote-peer negotiation progress on the client side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
    Closed,
    Failed { reason: String },
}

impl NegotiationState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// The remote description has been applied, so hints can go straight
    /// to the peer connection.
    pub fn accepts_hints(&self) -> bool {
        matches!(self, Self::OfferReceived | Self::AnswerExchanged | Self::Connected)
    }

    /// Still waiting on the remote side to finish the handshake.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::OfferSent | Self::OfferReceived | Self::AnswerExchanged
        )
    }
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::OfferSent => write!(f, "offer sent"),
            Self::OfferReceived => write!(f, "offer received"),
            Self::AnswerExchanged => write!(f, "answer exchanged"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_selector_uses_browser_names() {
        assert_eq!(serde_json::to_string(&TargetSelector::Leader).unwrap(), r#""Leader""#);
        assert_eq!(serde_json::to_string(&TargetSelector::All).unwrap(), r#""All""#);
        assert_eq!(
            serde_json::to_string(&TargetSelector::AllButSender).unwrap(),
            r#""All but Me""#
        );
    }

    #[test]
    fn connectivity_hint_matches_rtc_ice_candidate_init() {
        let json = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 53421 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}"#;
        let hint: ConnectivityHint = serde_json::from_str(json).expect("valid candidate");
        assert_eq!(hint.sdp_mid.as_deref(), Some("0"));
        assert_eq!(hint.sdp_mline_index, Some(0));
        assert_eq!(hint.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn identity_origin_is_optional() {
        let id: Identity = serde_json::from_str(r#"{"id":7}"#).unwrap();
        assert_eq!(id, Identity::with_id(7));
    }

    #[test]
    fn hints_are_accepted_once_remote_description_is_set() {
        assert!(!NegotiationState::Idle.accepts_hints());
        assert!(!NegotiationState::OfferSent.accepts_hints());
        assert!(NegotiationState::OfferReceived.accepts_hints());
        assert!(NegotiationState::AnswerExchanged.accepts_hints());
        assert!(NegotiationState::Connected.accepts_hints());
    }
}
