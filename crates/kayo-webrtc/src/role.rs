//! Leader/Follower negotiation.
//!
//! # Lifecycle (per remote peer)
//!
//! ```text
//! Leader                                  Follower
//! ──────                                  ────────
//! new follower ─► Idle ─► OfferSent
//!                         │  offer ─────► OfferReceived ─► AnswerExchanged
//!   AnswerExchanged ◄─────┘ ◄──── answer ┘
//!         │ channel open                        │ channel open
//!         ▼                                     ▼
//!     Connected ── channel closed / failure ─► removed
//! ```
//!
//! Hints that arrive before the remote description is applied, or before a
//! link for their origin even exists, are buffered and replayed in order.
//! A rejected description leaves the link in `Failed` until the remote side
//! starts over; nothing is retried automatically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kayo_core::messages::{HintRequest, OfferRequest, RoleAssignment};
use kayo_core::{
    ChatMessage, ClientMessage, ConnectivityHint, DataMessage, Identity, NegotiationError,
    NegotiationState, SessionDescription, TransportError,
};
use kayo_transport::{send_control, ChannelMessage, DataChannel, PeerTarget, DATA_CHANNEL_LABEL};
use tracing::{debug, error, info, warn};

use crate::peer::{PeerConnection, PeerConnector, PeerEvent, PeerEventSender, SignalSink};

/// What a peer event meant for the role, as far as the client cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkUpdate {
    Connected(u64),
    Disconnected(u64),
    Failed { peer: u64, reason: String },
    Data { peer: u64, message: ChannelMessage },
}

// MARK: - PeerLink

/// Peer connection and its data channel, kept under one key.
struct PeerLink {
    connection: Arc<dyn PeerConnection>,
    channel: Option<Arc<dyn DataChannel>>,
    state: NegotiationState,
    pending_hints: Vec<Option<ConnectivityHint>>,
    created: Instant,
}

impl PeerLink {
    fn new(connection: Arc<dyn PeerConnection>, early_hints: Vec<Option<ConnectivityHint>>) -> Self {
        Self {
            connection,
            channel: None,
            state: NegotiationState::Idle,
            pending_hints: early_hints,
            created: Instant::now(),
        }
    }

    /// Renegotiating an open link keeps it `Connected`.
    fn advance(&mut self, next: NegotiationState) {
        if !self.state.is_connected() {
            self.state = next;
        }
    }

    fn fail(&mut self, peer: u64, reason: String) {
        warn!(peer, %reason, "Negotiation failed");
        self.state = NegotiationState::Failed { reason };
    }

    async fn apply_hint(&mut self, peer: u64, hint: Option<ConnectivityHint>) {
        if !self.state.accepts_hints() {
            debug!(peer, state = %self.state, "Hint buffered");
            self.pending_hints.push(hint);
            return;
        }
        if let Err(e) = self.connection.add_connectivity_hint(hint).await {
            warn!(peer, error = %e, "Connectivity hint rejected");
        }
    }

    async fn replay_hints(&mut self, peer: u64) {
        let hints = std::mem::take(&mut self.pending_hints);
        if !hints.is_empty() {
            debug!(peer, count = hints.len(), "Replaying buffered hints");
        }
        for hint in hints {
            self.apply_hint(peer, hint).await;
        }
    }
}

// MARK: - Links

/// Link table and everything needed to grow it. Shared by both roles.
struct Links {
    own_id: u64,
    connector: Arc<dyn PeerConnector>,
    signal: Arc<dyn SignalSink>,
    events: PeerEventSender,
    peers: HashMap<u64, PeerLink>,
    early_hints: HashMap<u64, EarlyHints>,
}

/// Hints that arrived before their link; dropped if no link claims them in time.
struct EarlyHints {
    since: Instant,
    hints: Vec<Option<ConnectivityHint>>,
}

impl Links {
    fn signal(&self, message: ClientMessage) {
        if let Err(e) = self.signal.send_signal(&message) {
            error!(kind = message.kind(), error = %e, "Could not reach the signaling server");
        }
    }

    /// Create a fresh link to `peer`, closing whatever was there.
    async fn open(&mut self, peer: u64) -> Result<&mut PeerLink, NegotiationError> {
        if let Some(old) = self.peers.remove(&peer) {
            debug!(peer, state = %old.state, "Replacing peer link");
            old.connection.close().await;
        }
        let connection = self.connector.connect(peer, self.events.clone()).await?;
        let early = self.early_hints.remove(&peer).map(|e| e.hints).unwrap_or_default();
        Ok(self.peers.entry(peer).or_insert(PeerLink::new(connection, early)))
    }

    /// Apply a remote offer or answer from `origin`; answer it if it was an
    /// offer.
    async fn apply_remote(
        &mut self,
        origin: &Identity,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let peer = origin.id;
        let link = self.peers.get_mut(&peer).ok_or(NegotiationError::UnknownPeer { id: peer })?;
        if let NegotiationState::Failed { reason } = &link.state {
            return Err(NegotiationError::Rejected { reason: format!("link already failed: {reason}") });
        }

        let is_offer = desc.is_offer();
        if let Err(e) = link.connection.set_remote_description(desc).await {
            let reason = e.to_string();
            link.fail(peer, reason.clone());
            return Err(NegotiationError::Rejected { reason });
        }

        if !is_offer {
            link.advance(NegotiationState::AnswerExchanged);
            link.replay_hints(peer).await;
            debug!(peer, "Remote answer applied");
            return Ok(());
        }

        link.advance(NegotiationState::OfferReceived);
        link.replay_hints(peer).await;
        let answer = match link.connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                link.fail(peer, e.to_string());
                return Err(e);
            }
        };
        link.advance(NegotiationState::AnswerExchanged);
        self.signal(ClientMessage::Offer(OfferRequest { target: origin.clone(), offer: answer }));
        debug!(peer, "Answer sent");
        Ok(())
    }

    async fn add_hint(&mut self, origin: &Identity, hint: Option<ConnectivityHint>) {
        match self.peers.get_mut(&origin.id) {
            Some(link) => link.apply_hint(origin.id, hint).await,
            None => {
                debug!(peer = origin.id, "Hint for a peer without a link, buffered");
                self.early_hints
                    .entry(origin.id)
                    .or_insert_with(|| EarlyHints { since: Instant::now(), hints: Vec::new() })
                    .hints
                    .push(hint);
            }
        }
    }

    async fn handle_event(&mut self, event: PeerEvent) -> Option<LinkUpdate> {
        match event {
            PeerEvent::LocalHint { peer, hint } => {
                self.signal(ClientMessage::IceCandidate(HintRequest {
                    target: Identity::with_id(peer),
                    candidate: hint,
                }));
                None
            }
            PeerEvent::ChannelOpened { peer, channel } => {
                let Some(link) = self.peers.get_mut(&peer) else {
                    warn!(peer, "Channel opened for an unknown peer, closing it");
                    channel.close().await;
                    return None;
                };
                info!(peer, label = channel.label(), "Peer connected");
                link.channel = Some(channel);
                link.state = NegotiationState::Connected;
                Some(LinkUpdate::Connected(peer))
            }
            PeerEvent::Message { peer, message } => Some(LinkUpdate::Data { peer, message }),
            PeerEvent::ChannelClosed { peer } => {
                // A replaced link's old channel closing must not tear down the
                // new link that has not opened yet.
                if self.peers.get(&peer).is_some_and(|l| l.channel.is_none() && l.state.is_pending()) {
                    debug!(peer, "Stale channel close ignored");
                    return None;
                }
                self.remove(peer).await.then_some(LinkUpdate::Disconnected(peer))
            }
            PeerEvent::Failed { peer, reason } => {
                warn!(peer, %reason, "Peer connection failed");
                self.remove(peer).await.then_some(LinkUpdate::Failed { peer, reason })
            }
        }
    }

    fn connected(&self) -> Vec<PeerTarget> {
        let mut targets: Vec<_> = self
            .peers
            .iter()
            .filter(|(_, link)| link.state.is_connected())
            .filter_map(|(&peer, link)| link.channel.clone().map(|ch| PeerTarget::new(peer, ch)))
            .collect();
        targets.sort_by_key(|t| t.peer);
        targets
    }

    async fn remove(&mut self, peer: u64) -> bool {
        self.early_hints.remove(&peer);
        match self.peers.remove(&peer) {
            Some(link) => {
                if let Some(channel) = &link.channel {
                    channel.close().await;
                }
                link.connection.close().await;
                info!(peer, "Peer link removed");
                true
            }
            None => false,
        }
    }

    fn expire_stalled(&mut self, timeout: Duration) -> Vec<NegotiationError> {
        let ms = timeout.as_millis() as u64;
        let mut expired = Vec::new();
        for (&peer, link) in self.peers.iter_mut() {
            if link.state.is_pending() && link.created.elapsed() >= timeout {
                link.fail(peer, format!("not connected after {ms}ms"));
                expired.push(NegotiationError::TimedOut { id: peer, ms });
            }
        }
        self.early_hints.retain(|&peer, early| {
            let keep = early.since.elapsed() < timeout;
            if !keep {
                debug!(peer, count = early.hints.len(), "Unclaimed hints dropped");
            }
            keep
        });
        expired
    }

    async fn send_chat(&self, text: &str) -> Result<usize, TransportError> {
        let chat = ChatMessage { text: text.to_owned(), sender: self.own_id };
        let body = serde_json::to_string(&chat)
            .map_err(|e| TransportError::SendFailed { reason: e.to_string() })?;
        let frame = DataMessage::Text(body);

        let mut sent = 0;
        for target in self.connected() {
            match send_control(target.channel.as_ref(), &frame).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = target.peer, error = %e, "Chat line not delivered"),
            }
        }
        Ok(sent)
    }

    async fn close_all(&mut self) {
        let peers: Vec<u64> = self.peers.keys().copied().collect();
        for peer in peers {
            self.remove(peer).await;
        }
        self.early_hints.clear();
    }
}

// MARK: - Leader

/// Hub of the star: one link per Follower.
pub struct Leader {
    links: Links,
}

impl Leader {
    pub fn id(&self) -> u64 {
        self.links.own_id
    }

    pub fn answer_readiness(&self) -> Result<(), TransportError> {
        self.links.signal.send_signal(&ClientMessage::LeaderReady)
    }

    /// Start negotiating with a Follower that announced readiness.
    pub async fn new_follower(&mut self, identity: Identity) -> Result<(), NegotiationError> {
        let peer = identity.id;
        if let Some(existing) = self.links.peers.get(&peer) {
            if !matches!(existing.state, NegotiationState::Failed { .. } | NegotiationState::Closed) {
                warn!(peer, state = %existing.state, "Follower announced twice, ignored");
                return Ok(());
            }
        }

        info!(follower = %identity, "New follower, sending offer");
        let link = self.links.open(peer).await?;
        let offer = match link.connection.create_data_channel(DATA_CHANNEL_LABEL).await {
            Ok(()) => link.connection.create_offer().await,
            Err(e) => Err(e),
        };
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                link.fail(peer, e.to_string());
                return Err(e);
            }
        };
        link.advance(NegotiationState::OfferSent);
        self.links.signal(ClientMessage::Offer(OfferRequest { target: identity, offer }));
        Ok(())
    }

    pub async fn accept_offer(
        &mut self,
        desc: SessionDescription,
        origin: Identity,
    ) -> Result<(), NegotiationError> {
        if !self.links.peers.contains_key(&origin.id) {
            error!(follower = %origin, "Description from an unknown follower");
            return Err(NegotiationError::UnknownPeer { id: origin.id });
        }
        self.links.apply_remote(&origin, desc).await
    }
}

// MARK: - Follower

/// Spoke of the star: at most one link, to the Leader.
pub struct Follower {
    links: Links,
    leader: Option<Identity>,
}

impl Follower {
    pub fn id(&self) -> u64 {
        self.links.own_id
    }

    /// Known once the Leader's first offer arrived.
    pub fn leader(&self) -> Option<&Identity> {
        self.leader.as_ref()
    }

    pub fn answer_readiness(&self) -> Result<(), TransportError> {
        self.links.signal.send_signal(&ClientMessage::FollowerReady)
    }

    pub async fn accept_offer(
        &mut self,
        desc: SessionDescription,
        origin: Identity,
    ) -> Result<(), NegotiationError> {
        let peer = origin.id;
        if desc.is_offer() {
            let reusable = self
                .links
                .peers
                .get(&peer)
                .is_some_and(|link| !matches!(link.state, NegotiationState::Failed { .. }));
            if !reusable {
                let others: Vec<u64> = self.links.peers.keys().copied().filter(|&p| p != peer).collect();
                for other in others {
                    info!(old = other, new = peer, "Offer from a different leader, dropping old link");
                    self.links.remove(other).await;
                }
                self.links.open(peer).await?;
            }
            self.leader = Some(origin.clone());
        }
        self.links.apply_remote(&origin, desc).await
    }
}

// MARK: - Role

/// The client's side of the star topology.
pub enum Role {
    Leader(Leader),
    Follower(Follower),
}

impl Role {
    pub fn new(
        assignment: RoleAssignment,
        connector: Arc<dyn PeerConnector>,
        signal: Arc<dyn SignalSink>,
        events: PeerEventSender,
    ) -> Self {
        let links = Links {
            own_id: assignment.id,
            connector,
            signal,
            events,
            peers: HashMap::new(),
            early_hints: HashMap::new(),
        };
        match assignment.role {
            kayo_core::Role::Leader => Self::Leader(Leader { links }),
            kayo_core::Role::Follower => Self::Follower(Follower { links, leader: None }),
        }
    }

    fn links(&self) -> &Links {
        match self {
            Self::Leader(l) => &l.links,
            Self::Follower(f) => &f.links,
        }
    }

    fn links_mut(&mut self) -> &mut Links {
        match self {
            Self::Leader(l) => &mut l.links,
            Self::Follower(f) => &mut f.links,
        }
    }

    pub fn id(&self) -> u64 {
        self.links().own_id
    }

    pub fn kind(&self) -> kayo_core::Role {
        match self {
            Self::Leader(_) => kayo_core::Role::Leader,
            Self::Follower(_) => kayo_core::Role::Follower,
        }
    }

    /// Tell the server this client is ready for its role.
    pub fn answer_readiness(&self) -> Result<(), TransportError> {
        match self {
            Self::Leader(l) => l.answer_readiness(),
            Self::Follower(f) => f.answer_readiness(),
        }
    }

    pub async fn accept_offer(
        &mut self,
        desc: SessionDescription,
        origin: Identity,
    ) -> Result<(), NegotiationError> {
        match self {
            Self::Leader(l) => l.accept_offer(desc, origin).await,
            Self::Follower(f) => f.accept_offer(desc, origin).await,
        }
    }

    pub async fn add_connectivity_hint(&mut self, origin: &Identity, hint: Option<ConnectivityHint>) {
        self.links_mut().add_hint(origin, hint).await;
    }

    /// Only meaningful for the Leader; a Follower logs and ignores it.
    pub async fn new_follower(&mut self, identity: Identity) -> Result<(), NegotiationError> {
        match self {
            Self::Leader(l) => l.new_follower(identity).await,
            Self::Follower(_) => {
                warn!(follower = %identity, "Follower told about a new follower, ignored");
                Ok(())
            }
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Option<LinkUpdate> {
        self.links_mut().handle_event(event).await
    }

    /// Open channels, ordered by peer id.
    pub fn connected_channels(&self) -> Vec<PeerTarget> {
        self.links().connected()
    }

    pub fn peer_state(&self, peer: u64) -> Option<NegotiationState> {
        self.links().peers.get(&peer).map(|link| link.state.clone())
    }

    pub fn peers(&self) -> Vec<u64> {
        let mut peers: Vec<u64> = self.links().peers.keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    /// Close and forget the link to `peer`. `false` if there was none.
    pub async fn remove_peer(&mut self, peer: u64) -> bool {
        self.links_mut().remove(peer).await
    }

    /// Fail every link still negotiating after `timeout`.
    pub fn expire_stalled(&mut self, timeout: Duration) -> Vec<NegotiationError> {
        self.links_mut().expire_stalled(timeout)
    }

    /// Chat line to every connected peer (the Leader's followers, or a
    /// Follower's leader). Returns how many peers it reached.
    pub async fn send_message(&self, text: &str) -> Result<usize, TransportError> {
        let sent = self.links().send_chat(text).await?;
        if sent == 0 && matches!(self, Self::Follower(_)) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(sent)
    }

    pub async fn close(&mut self) {
        self.links_mut().close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use kayo_core::Role as RoleKind;
    use tokio::sync::mpsc;

    use super::*;
    use crate::loopback::LoopbackNetwork;

    struct Side {
        role: Role,
        signals: mpsc::UnboundedReceiver<ClientMessage>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn side(network: &LoopbackNetwork, role: RoleKind, id: u64) -> Side {
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let role = Role::new(
            RoleAssignment { role, id },
            Arc::new(network.connector()),
            Arc::new(signal_tx),
            event_tx,
        );
        Side { role, signals, events }
    }

    fn sent_offer(side: &mut Side) -> OfferRequest {
        loop {
            match side.signals.try_recv().expect("an offer was signaled") {
                ClientMessage::Offer(req) => return req,
                _ => continue,
            }
        }
    }

    /// Drive peer events until `side` reports `Connected(peer)`.
    async fn until_connected(side: &mut Side, peer: u64) {
        loop {
            let event = side.events.recv().await.expect("events open");
            if side.role.handle_peer_event(event).await == Some(LinkUpdate::Connected(peer)) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn leader_and_follower_reach_connected() {
        let network = LoopbackNetwork::new();
        let mut leader = side(&network, RoleKind::Leader, 0);
        let mut follower = side(&network, RoleKind::Follower, 1);

        leader.role.new_follower(Identity::with_id(1)).await.unwrap();
        assert_eq!(leader.role.peer_state(1), Some(NegotiationState::OfferSent));
        let offer = sent_offer(&mut leader);
        assert_eq!(offer.target.id, 1);

        follower.role.accept_offer(offer.offer, Identity::with_id(0)).await.unwrap();
        assert_eq!(follower.role.peer_state(0), Some(NegotiationState::AnswerExchanged));
        let answer = sent_offer(&mut follower);
        assert_eq!(answer.target.id, 0);
        assert!(!answer.offer.is_offer());

        leader.role.accept_offer(answer.offer, Identity::with_id(1)).await.unwrap();
        until_connected(&mut leader, 1).await;
        until_connected(&mut follower, 0).await;

        assert_eq!(leader.role.connected_channels().len(), 1);
        assert_eq!(follower.role.peer_state(0), Some(NegotiationState::Connected));
        if let Role::Follower(f) = &follower.role {
            assert_eq!(f.leader().map(|l| l.id), Some(0));
        }
    }

    #[tokio::test]
    async fn early_hints_are_buffered_then_replayed() {
        let network = LoopbackNetwork::new();
        let mut leader = side(&network, RoleKind::Leader, 0);
        let mut follower = side(&network, RoleKind::Follower, 1);

        // hints before any link exists
        follower.role.add_connectivity_hint(&Identity::with_id(0), None).await;
        assert!(follower.role.peers().is_empty());

        leader.role.new_follower(Identity::with_id(1)).await.unwrap();
        let offer = sent_offer(&mut leader);
        // hint for an existing link whose remote description is not set yet
        leader
            .role
            .add_connectivity_hint(&Identity::with_id(1), Some(ConnectivityHint::new("candidate:x")))
            .await;
        if let Role::Leader(l) = &leader.role {
            assert_eq!(l.links.peers[&1].pending_hints.len(), 1);
        }

        follower.role.accept_offer(offer.offer, Identity::with_id(0)).await.unwrap();
        if let Role::Follower(f) = &follower.role {
            assert!(f.links.peers[&0].pending_hints.is_empty());
            assert!(f.links.early_hints.is_empty());
        }

        let answer = sent_offer(&mut follower);
        leader.role.accept_offer(answer.offer, Identity::with_id(1)).await.unwrap();
        if let Role::Leader(l) = &leader.role {
            assert!(l.links.peers[&1].pending_hints.is_empty());
        }
    }

    #[tokio::test]
    async fn unclaimed_hints_expire_with_stalled_links() {
        let network = LoopbackNetwork::new();
        let mut leader = side(&network, RoleKind::Leader, 0);

        leader.role.add_connectivity_hint(&Identity::with_id(9), None).await;
        leader.role.add_connectivity_hint(&Identity::with_id(9), None).await;
        assert_eq!(leader.role.links().early_hints[&9].hints.len(), 2);

        assert!(leader.role.expire_stalled(Duration::from_secs(60)).is_empty());
        assert_eq!(leader.role.links().early_hints.len(), 1);

        assert!(leader.role.expire_stalled(Duration::ZERO).is_empty());
        assert!(leader.role.links().early_hints.is_empty());
        assert!(leader.role.peers().is_empty());
    }

    #[tokio::test]
    async fn local_hints_are_signaled_to_the_peer() {
        let network = LoopbackNetwork::new();
        let mut leader = side(&network, RoleKind::Leader, 0);
        leader.role.new_follower(Identity::with_id(4)).await.unwrap();
        sent_offer(&mut leader);

        let event = leader.events.recv().await.unwrap();
        assert!(leader.role.handle_peer_event(event).await.is_none());
        match leader.signals.try_recv().unwrap() {
            ClientMessage::IceCandidate(req) => {
                assert_eq!(req.target.id, 4);
                assert!(req.candidate.is_some());
            }
            other => panic!("expected a hint, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_answer_leaves_a_failed_link() {
        let network = LoopbackNetwork::new();
        let mut leader = side(&network, RoleKind::Leader, 0);
        leader.role.new_follower(Identity::with_id(1)).await.unwrap();

        let err = leader
            .role
            .accept_offer(SessionDescription::answer("garbage"), Identity::with_id(1))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Rejected { .. }));
        assert!(matches!(leader.role.peer_state(1), Some(NegotiationState::Failed { .. })));

        // re-announcement replaces the failed link
        leader.role.new_follower(Identity::with_id(1)).await.unwrap();
        assert_eq!(leader.role.peer_state(1), Some(NegotiationState::OfferSent));
    }

    #[tokio::test]
    async fn leader_refuses_descriptions_from_strangers() {
        let network = LoopbackNetwork::new();
        let mut leader = side(&network, RoleKind::Leader, 0);
        let err = leader
            .role
            .accept_offer(SessionDescription::answer("loopback:x"), Identity::with_id(9))
            .await
            .unwrap_err();
        assert_eq!(err, NegotiationError::UnknownPeer { id: 9 });
    }

    #[tokio::test]
    async fn duplicate_announcement_keeps_the_live_link() {
        let network = LoopbackNetwork::new();
        let mut leader = side(&network, RoleKind::Leader, 0);
        leader.role.new_follower(Identity::with_id(1)).await.unwrap();
        sent_offer(&mut leader);
        leader.role.new_follower(Identity::with_id(1)).await.unwrap();
        assert!(leader.signals.try_recv().map_or(true, |m| !matches!(m, ClientMessage::Offer(_))));
        assert_eq!(network.pending_offers(), 1);
    }

    #[tokio::test]
    async fn stalled_negotiation_expires() {
        let network = LoopbackNetwork::new();
        let mut leader = side(&network, RoleKind::Leader, 0);
        leader.role.new_follower(Identity::with_id(2)).await.unwrap();

        assert!(leader.role.expire_stalled(Duration::from_secs(60)).is_empty());
        let expired = leader.role.expire_stalled(Duration::ZERO);
        assert_eq!(expired, vec![NegotiationError::TimedOut { id: 2, ms: 0 }]);
        assert!(matches!(leader.role.peer_state(2), Some(NegotiationState::Failed { .. })));
        // already failed, not reported again
        assert!(leader.role.expire_stalled(Duration::ZERO).is_empty());
    }

    #[tokio::test]
    async fn chat_reaches_connected_followers() {
        let network = LoopbackNetwork::new();
        let mut leader = side(&network, RoleKind::Leader, 0);
        let mut follower = side(&network, RoleKind::Follower, 1);

        assert_eq!(follower.role.send_message("hi").await, Err(TransportError::ConnectionClosed));
        assert_eq!(leader.role.send_message("nobody").await, Ok(0));

        leader.role.new_follower(Identity::with_id(1)).await.unwrap();
        follower.role.accept_offer(sent_offer(&mut leader).offer, Identity::with_id(0)).await.unwrap();
        leader.role.accept_offer(sent_offer(&mut follower).offer, Identity::with_id(1)).await.unwrap();
        until_connected(&mut leader, 1).await;
        until_connected(&mut follower, 0).await;

        assert_eq!(leader.role.send_message("hello").await, Ok(1));
        loop {
            let event = follower.events.recv().await.unwrap();
            if let Some(LinkUpdate::Data { peer, message: ChannelMessage::Text(text) }) =
                follower.role.handle_peer_event(event).await
            {
                assert_eq!(peer, 0);
                let DataMessage::Text(body) = DataMessage::from_json(&text).unwrap() else {
                    panic!("expected a string frame");
                };
                let chat: ChatMessage = serde_json::from_str(&body).unwrap();
                assert_eq!(chat, ChatMessage { text: "hello".into(), sender: 0 });
                break;
            }
        }
    }

    #[tokio::test]
    async fn closed_channel_removes_the_link() {
        let network = LoopbackNetwork::new();
        let mut leader = side(&network, RoleKind::Leader, 0);
        let mut follower = side(&network, RoleKind::Follower, 1);

        leader.role.new_follower(Identity::with_id(1)).await.unwrap();
        follower.role.accept_offer(sent_offer(&mut leader).offer, Identity::with_id(0)).await.unwrap();
        leader.role.accept_offer(sent_offer(&mut follower).offer, Identity::with_id(1)).await.unwrap();
        until_connected(&mut leader, 1).await;
        until_connected(&mut follower, 0).await;

        assert!(follower.role.remove_peer(0).await);
        assert!(!follower.role.remove_peer(0).await);
        loop {
            let event = leader.events.recv().await.unwrap();
            if leader.role.handle_peer_event(event).await == Some(LinkUpdate::Disconnected(1)) {
                break;
            }
        }
        assert!(leader.role.peers().is_empty());
        assert!(leader.role.connected_channels().is_empty());
    }
}
