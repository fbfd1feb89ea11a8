//! Collaboration client.
//!
//! # Lifecycle
//!
//! ```text
//! 1. Client::connect(config, connector)
//!       ├─ signaling connect (projectID = session key)
//!       ├─ wait for `role assignment`, build the Role
//!       └─ send leader/follower ready
//! 2. driver task
//!       ├─ signaling events ─► Role (new follower, offer, ice candidate)
//!       ├─ peer events      ─► Role, then Reassembler for channel data
//!       └─ periodic expiry of stalled negotiations
//! 3. next_event() yields ClientEvent until the signaling connection ends
//! 4. close()
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kayo_core::messages::RoleAssignment;
use kayo_core::{
    ClientConfig, KayoError, NegotiationError, ServerMessage, TargetSelector, TransferError,
    TransferOptions, TransportError,
};
use kayo_signaling::{
    ServerTrust, SignalingClient, SignalingEvent, SignalingFile, SignalingFileAssembler, SignalingWriter,
};
use kayo_transport::{
    multicast_transfer, InboundData, MulticastTransfer, PeerTarget, ProgressSink, Reassembler,
    ReceivedFile,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::peer::{PeerConnector, PeerEvent, SignalSink};
use crate::role::{LinkUpdate, Role};

/// Everything the application hears about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    RoleAssigned(RoleAssignment),
    PeerConnected(u64),
    PeerDisconnected(u64),
    NegotiationFailed { peer: u64, error: NegotiationError },
    FileReceived(ReceivedFile),
    /// A file relayed through the signaling server.
    SignalingFileReceived(SignalingFile),
    Message { from: u64, text: String },
}

enum Command {
    SendMessage { text: String, reply: oneshot::Sender<Result<usize, TransportError>> },
    Channels { reply: oneshot::Sender<Vec<PeerTarget>> },
    Close,
}

pub struct Client {
    assignment: RoleAssignment,
    writer: SignalingWriter,
    transfer: TransferOptions,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    driver: JoinHandle<()>,
}

impl Client {
    /// Join `config.session_key` on `config.server_url` and start negotiating
    /// peer links through `connector`.
    ///
    /// A `wss://` server is verified against `config.ca_bundle` when set,
    /// otherwise its first certificate is pinned.
    pub async fn connect(
        config: ClientConfig,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Self, KayoError> {
        let trust = ServerTrust::for_client(&config);
        Self::connect_with_trust(config, connector, trust).await
    }

    /// Like [`connect`](Self::connect) with an explicit trust mode, e.g. a
    /// [`kayo_signaling::CertPin`] kept from an earlier session.
    pub async fn connect_with_trust(
        config: ClientConfig,
        connector: Arc<dyn PeerConnector>,
        trust: ServerTrust,
    ) -> Result<Self, KayoError> {
        let signaling =
            SignalingClient::connect_with_trust(&config.server_url, &config.session_key, trust).await?;
        let (writer, mut signaling_events) = signaling.split();

        // A zero timeout waits indefinitely.
        let timeout = config.negotiation_timeout();
        let assignment = if timeout.is_zero() {
            wait_for_role(&mut signaling_events).await?
        } else {
            tokio::time::timeout(timeout, wait_for_role(&mut signaling_events))
                .await
                .map_err(|_| TransportError::Timeout { ms: config.negotiation_timeout_ms })??
        };
        info!(role = %assignment.role, id = assignment.id, session = %config.session_key, "Role assigned");

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let role = Role::new(
            assignment,
            connector,
            Arc::new(writer.clone()) as Arc<dyn SignalSink>,
            peer_tx,
        );
        role.answer_readiness()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(ClientEvent::RoleAssigned(assignment));

        let driver = Driver {
            role,
            signaling: signaling_events,
            peers: peer_rx,
            commands: command_rx,
            events: event_tx,
            reassembler: Reassembler::new(),
            assembler: SignalingFileAssembler::new(),
            negotiation_timeout: timeout,
        };
        let driver = tokio::spawn(driver.run());

        Ok(Self {
            assignment,
            writer,
            transfer: config.transfer,
            commands: command_tx,
            events: event_rx,
            driver,
        })
    }

    pub fn id(&self) -> u64 {
        self.assignment.id
    }

    pub fn role(&self) -> kayo_core::Role {
        self.assignment.role
    }

    /// `None` once the signaling connection is gone and every event was read.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Ids of peers with an open channel.
    pub async fn connected_peers(&self) -> Vec<u64> {
        self.channels().await.into_iter().map(|t| t.peer).collect()
    }

    async fn channels(&self) -> Vec<PeerTarget> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Channels { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Chat line to every connected peer. Returns how many it reached.
    pub async fn send_message(&self, text: &str) -> Result<usize, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendMessage { text: text.to_owned(), reply })
            .map_err(|_| TransportError::ConnectionClosed)?;
        rx.await.map_err(|_| TransportError::ConnectionClosed)?
    }

    /// Send a file over the peer channels: to every Follower when leading,
    /// to the Leader when following. One independent transfer per peer.
    pub async fn send_file(
        &self,
        name: &str,
        payload: Bytes,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<MulticastTransfer, TransferError> {
        let targets = self.channels().await;
        if targets.is_empty() {
            warn!(file = name, "No connected peer to send to");
            return Err(TransferError::ChannelClosed { sent: 0, total: payload.len() as u64 });
        }
        Ok(multicast_transfer(name, payload, targets, self.transfer.clone(), progress))
    }

    /// Send a file through the signaling server instead of a peer channel.
    pub async fn send_file_via_signaling(
        &self,
        name: &str,
        target: TargetSelector,
        payload: &Bytes,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<u64, TransferError> {
        self.writer.send_file(name, target, payload, progress).await
    }

    /// Close every peer link and the signaling connection.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        if let Err(e) = self.driver.await {
            warn!(error = %e, "Client driver ended abnormally");
        }
        self.writer.close();
    }
}

async fn wait_for_role(
    events: &mut mpsc::UnboundedReceiver<SignalingEvent>,
) -> Result<RoleAssignment, TransportError> {
    while let Some(event) = events.recv().await {
        match event {
            SignalingEvent::Message(ServerMessage::RoleAssignment(assignment)) => return Ok(assignment),
            SignalingEvent::Closed => break,
            other => warn!(?other, "Signaling traffic before role assignment, dropped"),
        }
    }
    Err(TransportError::ConnectionClosed)
}

// ── Driver ───────────────────────────────────────────────────────────────────

struct Driver {
    role: Role,
    signaling: mpsc::UnboundedReceiver<SignalingEvent>,
    peers: mpsc::UnboundedReceiver<PeerEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    reassembler: Reassembler,
    assembler: SignalingFileAssembler,
    negotiation_timeout: Duration,
}

impl Driver {
    async fn run(mut self) {
        let expiry_enabled = !self.negotiation_timeout.is_zero();
        let period = (self.negotiation_timeout / 4).max(Duration::from_millis(50));
        let mut expiry = tokio::time::interval(period);

        loop {
            tokio::select! {
                event = self.signaling.recv() => match event {
                    Some(SignalingEvent::Closed) | None => {
                        info!(id = self.role.id(), "Signaling connection closed");
                        break;
                    }
                    Some(event) => self.on_signaling(event).await,
                },
                Some(event) = self.peers.recv() => self.on_peer(event).await,
                command = self.commands.recv() => match command {
                    Some(Command::SendMessage { text, reply }) => {
                        let _ = reply.send(self.role.send_message(&text).await);
                    }
                    Some(Command::Channels { reply }) => {
                        let _ = reply.send(self.role.connected_channels());
                    }
                    Some(Command::Close) | None => break,
                },
                _ = expiry.tick(), if expiry_enabled => {
                    for error in self.role.expire_stalled(self.negotiation_timeout) {
                        let peer = match &error {
                            NegotiationError::TimedOut { id, .. } => *id,
                            _ => continue,
                        };
                        self.emit(ClientEvent::NegotiationFailed { peer, error });
                    }
                }
            }
        }

        self.role.close().await;
        debug!("Client driver stopped");
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("Client event receiver dropped");
        }
    }

    async fn on_signaling(&mut self, event: SignalingEvent) {
        if let Some(file) = self.assembler.on_event(&event) {
            info!(file = %file.name, bytes = file.data.len(), "File received over signaling");
            self.emit(ClientEvent::SignalingFileReceived(file));
        }

        let SignalingEvent::Message(message) = event else {
            return;
        };
        match message {
            ServerMessage::NewFollower(identity) => {
                let peer = identity.id;
                if let Err(error) = self.role.new_follower(identity).await {
                    self.emit(ClientEvent::NegotiationFailed { peer, error });
                }
            }
            ServerMessage::Offer(relayed) => {
                let peer = relayed.origin.id;
                if let Err(error) = self.role.accept_offer(relayed.offer, relayed.origin).await {
                    self.emit(ClientEvent::NegotiationFailed { peer, error });
                }
            }
            ServerMessage::IceCandidate(relayed) => {
                self.role.add_connectivity_hint(&relayed.origin, relayed.candidate).await;
            }
            ServerMessage::Text(text) => debug!(%text, "Server says"),
            ServerMessage::RoleAssignment(again) => {
                warn!(role = %again.role, id = again.id, "Second role assignment ignored");
            }
            ServerMessage::StartOfFile(_) | ServerMessage::EndOfFile(_) => {}
        }
    }

    async fn on_peer(&mut self, event: PeerEvent) {
        let Some(update) = self.role.handle_peer_event(event).await else {
            return;
        };
        match update {
            LinkUpdate::Connected(peer) => self.emit(ClientEvent::PeerConnected(peer)),
            LinkUpdate::Disconnected(peer) => {
                self.reassembler.forget(peer);
                self.emit(ClientEvent::PeerDisconnected(peer));
            }
            LinkUpdate::Failed { peer, reason } => {
                self.reassembler.forget(peer);
                self.emit(ClientEvent::NegotiationFailed {
                    peer,
                    error: NegotiationError::Platform { reason },
                });
            }
            LinkUpdate::Data { peer, message } => match self.reassembler.on_message(peer, message) {
                Some(InboundData::File(file)) => self.emit(ClientEvent::FileReceived(file)),
                Some(InboundData::Chat { from, text }) => self.emit(ClientEvent::Message { from, text }),
                None => {}
            },
        }
    }
}
