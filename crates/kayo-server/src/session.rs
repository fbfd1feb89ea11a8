//! One collaboration session: the participants sharing a session key.
//!
//! The first participant becomes the Leader. There is no promotion: when the
//! Leader leaves, the session stays leaderless until it empties out.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use kayo_core::messages::RoleAssignment;
use kayo_core::{Identity, RelayError, Role, ServerMessage, TargetSelector};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

// MARK: - Outbound

/// Frame queued for a participant's connection writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    Close,
}

impl Outbound {
    pub fn message(msg: &ServerMessage) -> Result<Self, RelayError> {
        msg.to_json()
            .map(Self::Text)
            .map_err(|e| RelayError::Encode { reason: e.to_string() })
    }
}

/// Frames a connection may have waiting before it counts as lagging.
pub const OUTBOUND_QUEUE_FRAMES: usize = 256;

/// Write side of a participant's connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Outbound>,
    lagged: Arc<Notify>,
}

/// Read side, drained by the connection's socket writer.
#[derive(Debug)]
pub struct ConnectionQueue {
    rx: mpsc::Receiver<Outbound>,
    lagged: Arc<Notify>,
}

/// Bounded outbound queue for one connection.
pub fn connection_queue(capacity: usize) -> (ConnectionHandle, ConnectionQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let lagged = Arc::new(Notify::new());
    (ConnectionHandle { tx, lagged: lagged.clone() }, ConnectionQueue { rx, lagged })
}

impl ConnectionHandle {
    /// Queue a frame without waiting. A full queue flags the connection as
    /// lagging; its owner is expected to drop it.
    pub fn send(&self, frame: Outbound) -> Result<(), TrySendError<Outbound>> {
        let result = self.tx.try_send(frame);
        if matches!(result, Err(TrySendError::Full(_))) {
            self.lagged.notify_one();
        }
        result
    }
}

impl ConnectionQueue {
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        self.rx.try_recv()
    }

    /// Signal raised when a sender found the queue full.
    pub fn lag_signal(&self) -> Arc<Notify> {
        self.lagged.clone()
    }
}

// MARK: - Participant

/// What a joiner learns about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub identity: Identity,
    pub role: Role,
}

impl Participant {
    pub fn id(&self) -> u64 {
        self.identity.id
    }
}

struct Member {
    identity: Identity,
    role: Role,
    conn: ConnectionHandle,
}

/// Outcome of a follower announcing readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// `new follower` went to the Leader.
    Notified,
    /// The Leader is not ready yet; the follower is queued.
    Queued,
}

// MARK: - Session

#[derive(Default)]
struct SessionState {
    members: BTreeMap<u64, Member>,
    leader: Option<u64>,
    leader_ready: bool,
    pending_followers: Vec<u64>,
    next_id: u64,
    closed: bool,
}

pub struct Session {
    key: String,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), state: Mutex::new(SessionState::default()) }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Membership ───────────────────────────────────────────────────────────

    /// Add a participant. The first one in (while no leader is set) leads.
    pub fn join(
        &self,
        conn: ConnectionHandle,
        origin: Option<String>,
    ) -> Result<Participant, RelayError> {
        let mut state = self.lock();
        if state.closed {
            return Err(RelayError::SessionClosed { key: self.key.clone() });
        }

        let id = state.next_id;
        let role = if state.leader.is_none() { Role::Leader } else { Role::Follower };

        // The role assignment is always the first frame a connection sees.
        let assignment = Outbound::message(&ServerMessage::RoleAssignment(RoleAssignment { role, id }))?;
        let _ = conn.send(assignment);

        state.next_id += 1;
        if role == Role::Leader {
            state.leader = Some(id);
            state.leader_ready = false;
        }

        let identity = Identity::new(id, origin);
        state.members.insert(id, Member { identity: identity.clone(), role, conn });
        info!(session = %self.key, participant = %identity, %role, "Participant joined");

        Ok(Participant { identity, role })
    }

    /// Remove a participant. Returns `true` when the session is now empty.
    /// Leaving twice is a no-op.
    pub fn leave(&self, id: u64) -> bool {
        let mut state = self.lock();
        if let Some(member) = state.members.remove(&id) {
            info!(session = %self.key, participant = %member.identity, role = %member.role, "Participant left");
        }
        if state.leader == Some(id) {
            state.leader = None;
            state.leader_ready = false;
        }
        state.pending_followers.retain(|&f| f != id);
        state.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().members.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn leader(&self) -> Option<u64> {
        self.lock().leader
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.lock()
            .members
            .values()
            .map(|m| Participant { identity: m.identity.clone(), role: m.role })
            .collect()
    }

    /// Mark closed if empty. Used by the registry while holding its own lock.
    pub(crate) fn close_if_empty(&self) -> bool {
        let mut state = self.lock();
        if state.members.is_empty() {
            state.closed = true;
        }
        state.closed
    }

    /// Close the session and ask every connection to hang up.
    pub(crate) fn close_all(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        state.leader = None;
        state.pending_followers.clear();
        let members = std::mem::take(&mut state.members);
        for member in members.values() {
            let _ = member.conn.send(Outbound::Close);
        }
        members.len()
    }

    // ── Relay ────────────────────────────────────────────────────────────────

    /// Forward a message to one participant.
    pub fn relay_to_identity(&self, target: u64, msg: &ServerMessage) -> Result<(), RelayError> {
        let frame = Outbound::message(msg)?;
        let state = self.lock();
        let Some(member) = state.members.get(&target) else {
            error!(session = %self.key, target, kind = msg.kind(), "Identity id {} unknown", target);
            return Err(RelayError::UnknownTarget { id: target });
        };
        deliver(&self.key, member, frame)
    }

    /// Fan a message out per `selector`. Returns how many connections got it.
    pub fn relay_broadcast(
        &self,
        selector: TargetSelector,
        msg: &ServerMessage,
        sender: u64,
    ) -> Result<usize, RelayError> {
        let frame = Outbound::message(msg)?;
        self.fan_out(selector, frame, sender)
    }

    /// Same fan-out as [`relay_broadcast`](Self::relay_broadcast) for raw bytes.
    pub fn relay_binary(
        &self,
        data: Bytes,
        selector: TargetSelector,
        sender: u64,
    ) -> Result<usize, RelayError> {
        self.fan_out(selector, Outbound::Binary(data), sender)
    }

    fn fan_out(
        &self,
        selector: TargetSelector,
        frame: Outbound,
        sender: u64,
    ) -> Result<usize, RelayError> {
        let state = self.lock();
        let targets: Vec<&Member> = match selector {
            TargetSelector::Leader => {
                let Some(leader) = state.leader.and_then(|id| state.members.get(&id)) else {
                    warn!(session = %self.key, sender, "No leader");
                    return Err(RelayError::NoLeader);
                };
                vec![leader]
            }
            TargetSelector::All => state.members.values().collect(),
            TargetSelector::AllButSender => {
                state.members.values().filter(|m| m.identity.id != sender).collect()
            }
        };

        let mut delivered = 0;
        for member in targets {
            if deliver(&self.key, member, frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    // ── Readiness ────────────────────────────────────────────────────────────

    /// The Leader can take offers. Flushes followers that were ready first.
    pub fn leader_ready(&self, sender: u64) -> Result<usize, RelayError> {
        let mut state = self.lock();
        if state.leader != Some(sender) {
            warn!(session = %self.key, sender, "Leader ready from a non-leader, ignored");
            return Ok(0);
        }
        state.leader_ready = true;

        let pending = std::mem::take(&mut state.pending_followers);
        let Some(leader) = state.members.get(&sender) else {
            return Ok(0);
        };
        let mut flushed = 0;
        for id in pending {
            let Some(follower) = state.members.get(&id) else { continue };
            let frame = Outbound::message(&ServerMessage::NewFollower(follower.identity.clone()))?;
            if deliver(&self.key, leader, frame).is_ok() {
                flushed += 1;
            }
        }
        debug!(session = %self.key, flushed, "Leader ready");
        Ok(flushed)
    }

    /// A Follower can take offers. Tells the Leader, or queues until it is ready.
    pub fn follower_ready(&self, sender: u64) -> Result<Readiness, RelayError> {
        let mut state = self.lock();
        let Some(follower) = state.members.get(&sender) else {
            return Err(RelayError::UnknownTarget { id: sender });
        };
        let identity = follower.identity.clone();

        let Some(leader_id) = state.leader else {
            warn!(session = %self.key, follower = %identity, "No leader");
            return Err(RelayError::NoLeader);
        };

        if !state.leader_ready {
            if !state.pending_followers.contains(&sender) {
                state.pending_followers.push(sender);
            }
            debug!(session = %self.key, follower = %identity, "Leader not ready, follower queued");
            return Ok(Readiness::Queued);
        }

        let frame = Outbound::message(&ServerMessage::NewFollower(identity))?;
        let leader = state.members.get(&leader_id).ok_or(RelayError::NoLeader)?;
        deliver(&self.key, leader, frame)?;
        Ok(Readiness::Notified)
    }
}

fn deliver(key: &str, member: &Member, frame: Outbound) -> Result<(), RelayError> {
    match member.conn.send(frame) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            warn!(session = %key, participant = %member.identity, "Outbound queue full, disconnecting");
            Err(RelayError::Lagging { id: member.identity.id })
        }
        Err(TrySendError::Closed(_)) => {
            warn!(session = %key, participant = %member.identity, "Connection gone, frame dropped");
            Err(RelayError::ConnectionGone { id: member.identity.id })
        }
    }
}
