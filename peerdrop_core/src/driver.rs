//! The session event loop.
//!
//! One task owns all session state. Commands, relay envelopes and per-peer
//! inputs (link events, negotiation results, writer progress) arrive on
//! channels and are handled one at a time; anything slow runs in a spawned
//! task whose result comes back as a message stamped with the peer's epoch.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::coordinator::{CompletionPolicy, Coordinator, PeerTransfer};
use crate::error::{RequestRejection, SessionError};
use crate::negotiation::link::{
    Connector, DataLink, LinkEvent, Negotiated, PeerId, PeerInput, PeerMessage,
};
use crate::signaling::envelope::{Action, Envelope};
use crate::signaling::relay::{RelayChannels, RelayEvent};
use crate::signaling::session::{Role, Session};
use crate::transfer::outbox::Outbound;
use crate::transfer::policy::AccessPolicy;
use crate::transfer::progress::TransferState;
use crate::transfer::protocol::{ControlFrame, Frame};
use crate::transfer::receiver::{ChunkOutcome, Download, ReceivedFile};
use crate::transfer::sender::{RequestDecision, Share, SharedFile};
use crate::transfer::utils::validate_share;
use crate::{PeerSnapshot, SessionCommand, SessionEvent, SessionSnapshot};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub completion: CompletionPolicy,
    /// Save received files here as they complete
    pub save_dir: Option<PathBuf>,
}

/// Front-end handle to a running session loop
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Start the loop. The returned event stream must be drained: progress
    /// events are dropped when it backs up, every other event waits for room.
    pub fn spawn(
        role: Role,
        options: SessionOptions,
        connector: Arc<dyn Connector>,
        relay: RelayChannels,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::new(role));

        let task = tokio::spawn(run_session(
            role,
            options,
            connector,
            relay,
            cmd_rx,
            event_tx,
            snapshot_tx,
        ));
        (
            Self {
                cmd_tx,
                snapshot,
                task,
            },
            event_rx,
        )
    }

    pub async fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("session loop has stopped"))
    }

    pub async fn create_session(&self) -> Result<()> {
        self.send(SessionCommand::CreateSession).await
    }

    pub async fn join_session(&self, session_id: impl Into<String>) -> Result<()> {
        self.send(SessionCommand::JoinSession {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn share_file(&self, file: SharedFile, policy: AccessPolicy) -> Result<()> {
        self.send(SessionCommand::ShareFile { file, policy }).await
    }

    pub async fn send_metadata(&self, peer_id: impl Into<PeerId>) -> Result<()> {
        self.send(SessionCommand::SendMetadata {
            peer_id: peer_id.into(),
        })
        .await
    }

    pub async fn broadcast_metadata(&self) -> Result<()> {
        self.send(SessionCommand::BroadcastMetadata).await
    }

    pub async fn request_download(&self, password: Option<String>) -> Result<()> {
        self.send(SessionCommand::RequestDownload { password }).await
    }

    pub async fn disconnect_peer(&self, peer_id: impl Into<PeerId>) -> Result<()> {
        self.send(SessionCommand::DisconnectPeer {
            peer_id: peer_id.into(),
        })
        .await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for it to tear everything down
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
        self.task.await?;
        Ok(())
    }
}

enum Flow {
    Continue,
    Stop(String),
}

pub async fn run_session(
    role: Role,
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    relay: RelayChannels,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
) {
    let RelayChannels {
        outbound,
        inbound: mut relay_rx,
    } = relay;
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();

    let mut driver = Driver {
        options,
        session: Session::new(role),
        peers: Coordinator::new(peer_tx),
        share: None,
        connector,
        relay: outbound,
        event_tx,
        snapshot_tx,
        expires_at: None,
        share_generation: 0,
    };
    info!("Session loop started ({:?})", role);

    let reason = loop {
        let expiry = driver.expires_at;
        let flow = tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Shutdown) | None => Flow::Stop("session shut down".to_string()),
                Some(cmd) => driver.handle_command(cmd).await,
            },
            event = relay_rx.recv() => match event {
                Some(event) => driver.handle_relay(event).await,
                None => Flow::Stop("relay connection lost".to_string()),
            },
            Some(msg) = peer_rx.recv() => {
                driver.handle_peer(msg).await;
                Flow::Continue
            }
            _ = wait_until(expiry) => {
                info!("Share expired");
                driver.emit(SessionEvent::ShareExpired).await;
                Flow::Stop("share expired".to_string())
            }
        };
        driver.publish();
        if let Flow::Stop(reason) = flow {
            break reason;
        }
    };

    driver.close(reason).await;
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn send_envelope(relay: &mpsc::UnboundedSender<Envelope>, envelope: Envelope) {
    if relay.send(envelope).is_err() {
        warn!("Relay connection gone, envelope dropped");
    }
}

fn apply_remote_descriptors(peer: &str, link: Arc<dyn DataLink>, descriptors: Vec<String>) {
    if descriptors.is_empty() {
        return;
    }
    let peer = peer.to_string();
    tokio::spawn(async move {
        for descriptor in descriptors {
            if let Err(e) = link.add_remote_descriptor(descriptor).await {
                warn!("Could not apply descriptor from {}: {}", peer, e);
            }
        }
    });
}

struct Driver {
    options: SessionOptions,
    session: Session,
    peers: Coordinator,
    share: Option<Share>,
    connector: Arc<dyn Connector>,
    relay: mpsc::UnboundedSender<Envelope>,
    event_tx: mpsc::Sender<SessionEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    expires_at: Option<Instant>,
    /// Bumped on every ShareFile; outgoing transfers remember the one they stream
    share_generation: u64,
}

impl Driver {
    async fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event).await;
    }

    fn require(&self, role: Role) -> Result<(), SessionError> {
        if self.session.role() == role {
            Ok(())
        } else {
            Err(SessionError::WrongRole(role))
        }
    }

    async fn close(&mut self, reason: String) {
        let torn_down = self.peers.clear();
        self.session.on_relay_closed();
        info!("Session closed ({}), {} peer link(s) torn down", reason, torn_down);
        self.publish();
        self.emit(SessionEvent::SessionClosed { reason }).await;
    }

    // ---- commands ----

    async fn handle_command(&mut self, cmd: SessionCommand) -> Flow {
        let result = match cmd {
            SessionCommand::CreateSession => self.require(Role::Sender).map(|_| {
                self.session.create(&self.relay);
            }),
            SessionCommand::JoinSession { session_id } => {
                self.require(Role::Receiver).map(|_| {
                    self.session.join(&session_id, &self.relay);
                })
            }
            SessionCommand::ShareFile { file, policy } => self.share_file(file, policy),
            SessionCommand::SendMetadata { peer_id } => self.send_metadata(&peer_id),
            SessionCommand::BroadcastMetadata => self.broadcast_metadata(),
            SessionCommand::RequestDownload { password } => self.request_download(password).await,
            SessionCommand::DisconnectPeer { peer_id } => {
                if self.peers.get(&peer_id).is_some() {
                    self.drop_peer(&peer_id, "disconnected locally").await;
                    Ok(())
                } else {
                    Err(SessionError::UnknownPeer(peer_id))
                }
            }
            SessionCommand::Shutdown => return Flow::Stop("session shut down".to_string()),
        };

        if let Err(e) = result {
            warn!("Command failed: {}", e);
            self.emit(SessionEvent::Error(e.to_string())).await;
        }
        Flow::Continue
    }

    fn share_file(&mut self, file: SharedFile, policy: AccessPolicy) -> Result<(), SessionError> {
        self.require(Role::Sender)?;
        validate_share(&file.name, file.size())?;

        info!(
            "Sharing {} ({} bytes, limit {}, password {})",
            file.name,
            file.size(),
            policy.download_limit,
            if policy.password.enabled { "on" } else { "off" }
        );
        self.expires_at = policy.expires_after.map(|lifetime| Instant::now() + lifetime);

        let share = Share::new(file, policy);
        let metadata = share.metadata();
        self.share = Some(share);
        self.share_generation += 1;
        self.peers.clear_reservations();
        self.peers.broadcast_metadata(&metadata);
        Ok(())
    }

    fn send_metadata(&mut self, peer: &str) -> Result<(), SessionError> {
        self.require(Role::Sender)?;
        let metadata = self
            .share
            .as_ref()
            .ok_or(SessionError::NoSharedFile)?
            .metadata();
        let entry = self
            .peers
            .get(peer)
            .ok_or_else(|| SessionError::UnknownPeer(peer.to_string()))?;
        if !entry.is_ready() {
            return Err(SessionError::ChannelNotOpen);
        }
        if entry.transfer.state().is_active() {
            return Err(SessionError::TransferActive);
        }
        self.peers.send_metadata(peer, &metadata);
        Ok(())
    }

    fn broadcast_metadata(&mut self) -> Result<(), SessionError> {
        self.require(Role::Sender)?;
        let metadata = self
            .share
            .as_ref()
            .ok_or(SessionError::NoSharedFile)?
            .metadata();
        let sent = self.peers.broadcast_metadata(&metadata);
        debug!("Metadata broadcast to {} peer(s)", sent.len());
        Ok(())
    }

    async fn request_download(&mut self, password: Option<String>) -> Result<(), SessionError> {
        self.require(Role::Receiver)?;
        let peer = self
            .peers
            .peers()
            .next()
            .map(|e| e.peer.clone())
            .ok_or(SessionError::NoPeer)?;
        let entry = self.peers.get_mut(&peer).ok_or(SessionError::NoPeer)?;
        if !entry.is_ready() {
            return Err(SessionError::ChannelNotOpen);
        }
        let download = entry
            .download_mut()
            .ok_or(SessionError::WrongRole(Role::Receiver))?;

        let immediate = download.begin_request()?;
        let state = download.state().clone();
        entry.send(Outbound::Control(ControlFrame::SendFileRequest { password }));
        if immediate.is_some() {
            entry.send(Outbound::Control(ControlFrame::FileReceived));
        }

        info!("Requested file from {}", peer);
        self.emit_progress(&peer, &state, false).await;
        if let Some(file) = immediate {
            self.deliver(file).await;
        }
        Ok(())
    }

    // ---- relay ----

    async fn handle_relay(&mut self, event: RelayEvent) -> Flow {
        match event {
            RelayEvent::Connected => {
                self.session.on_relay_connected();
                self.emit(SessionEvent::RelayConnected).await;
            }
            RelayEvent::Envelope(envelope) => self.handle_envelope(envelope).await,
            RelayEvent::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "relay connection closed".to_string());
                warn!("Relay closed: {}", reason);
                return Flow::Stop(reason);
            }
        }
        Flow::Continue
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let from = envelope.session().map(str::to_string);
        match (envelope.action, from) {
            (Action::SessionCreated, Some(id)) => {
                if self.session.on_session_created(&id) {
                    self.emit(SessionEvent::SessionCreated { session_id: id }).await;
                }
            }
            (Action::PeerJoined, Some(peer)) => self.on_peer_joined(peer).await,
            (Action::Offer, Some(peer)) => {
                self.on_offer(peer, envelope.sdp.unwrap_or_default()).await
            }
            (Action::Answer, Some(peer)) => self.on_answer(&peer, envelope.sdp.unwrap_or_default()),
            (Action::Candidate, Some(peer)) => {
                self.on_remote_descriptor(&peer, envelope.candidate.unwrap_or_default())
            }
            (Action::PeerLeft, Some(peer)) => self.drop_peer(&peer, "peer left").await,
            (Action::Error, _) => {
                let message = envelope.error_message().to_string();
                warn!("Relay error: {}", message);
                self.emit(SessionEvent::RelayError(message)).await;
            }
            (action, _) => warn!("Ignoring relay {:?} envelope", action),
        }
    }

    async fn on_peer_joined(&mut self, peer: PeerId) {
        if self.session.role() != Role::Sender {
            warn!("Receiver got peer_joined from {}, ignoring", peer);
            return;
        }
        let (entry, held_slot) = self
            .peers
            .admit(&peer, PeerTransfer::Outgoing(TransferState::new()));
        let sink = entry.sink();
        if held_slot {
            self.release_slot();
        }

        info!("Peer {} joined, creating offer", peer);
        let connector = self.connector.clone();
        let peer_id = peer.clone();
        tokio::spawn(async move {
            let input = match connector.create_offer(peer_id, sink.clone()).await {
                Ok(negotiated) => PeerInput::OfferReady(negotiated),
                Err(e) => PeerInput::NegotiationFailed(format!("create offer: {:#}", e)),
            };
            sink.post(input);
        });
        self.emit(SessionEvent::PeerJoined { peer_id: peer }).await;
    }

    async fn on_offer(&mut self, peer: PeerId, sdp: String) {
        if self.session.role() != Role::Receiver {
            warn!("Sender got an offer from {}, ignoring", peer);
            return;
        }
        let first = self.session.id().is_none();
        if !self.session.accept_offer_from(&peer) {
            warn!("Offer from {} is not for the joined session, ignoring", peer);
            return;
        }

        let (entry, _) = self
            .peers
            .admit(&peer, PeerTransfer::Incoming(Download::new()));
        entry.negotiator.offer_received();
        let sink = entry.sink();

        info!("Offer from {}, answering", peer);
        let connector = self.connector.clone();
        let peer_id = peer.clone();
        tokio::spawn(async move {
            let input = match connector.accept_offer(peer_id, sdp, sink.clone()).await {
                Ok(negotiated) => PeerInput::AnswerReady(negotiated),
                Err(e) => PeerInput::NegotiationFailed(format!("accept offer: {:#}", e)),
            };
            sink.post(input);
        });

        if first {
            self.emit(SessionEvent::SessionJoined { session_id: peer }).await;
        }
    }

    fn on_answer(&mut self, peer: &str, sdp: String) {
        let Some(entry) = self.peers.get_mut(peer) else {
            warn!("Answer from unknown peer {}", peer);
            return;
        };
        if !entry.negotiator.answer_received() {
            warn!("Unexpected answer from {}, ignoring", peer);
            return;
        }
        let (Some(link), sink) = (entry.link(), entry.sink()) else {
            return;
        };
        tokio::spawn(async move {
            let input = match link.apply_answer(sdp).await {
                Ok(()) => PeerInput::RemoteDescriptionApplied,
                Err(e) => PeerInput::NegotiationFailed(format!("apply answer: {:#}", e)),
            };
            sink.post(input);
        });
    }

    fn on_remote_descriptor(&mut self, peer: &str, raw: String) {
        let Some(entry) = self.peers.get_mut(peer) else {
            debug!("Descriptor from unknown peer {}", peer);
            return;
        };
        if let Some(raw) = entry.negotiator.remote_descriptor(raw) {
            if let Some(link) = entry.link() {
                apply_remote_descriptors(peer, link, vec![raw]);
            }
        }
    }

    // ---- per-peer inputs ----

    async fn handle_peer(&mut self, msg: PeerMessage) {
        let PeerMessage { peer, epoch, input } = msg;
        if !self.peers.is_live(&peer, epoch) {
            debug!("Dropping stale input for {} (epoch {})", peer, epoch);
            if let PeerInput::OfferReady(negotiated) | PeerInput::AnswerReady(negotiated) = input {
                let _ = negotiated.link.close().await;
            }
            return;
        }

        match input {
            PeerInput::OfferReady(negotiated) => self.on_offer_ready(&peer, negotiated),
            PeerInput::AnswerReady(negotiated) => self.on_answer_ready(&peer, negotiated),
            PeerInput::RemoteDescriptionApplied => {
                if let Some(entry) = self.peers.get_mut(&peer) {
                    let queued = entry.negotiator.remote_description_applied();
                    if let Some(link) = entry.link() {
                        apply_remote_descriptors(&peer, link, queued);
                    }
                }
            }
            PeerInput::NegotiationFailed(reason) => {
                error!("Negotiation with {} failed: {}", peer, reason);
                self.drop_peer(&peer, &reason).await;
            }
            PeerInput::Link(event) => self.on_link_event(&peer, event).await,
            PeerInput::ChunkSent { offset } => self.on_chunk_sent(&peer, offset).await,
            PeerInput::SendFailed(reason) => {
                error!("Channel to {} failed: {}", peer, reason);
                self.drop_peer(&peer, &format!("send failed: {}", reason))
                    .await;
            }
        }
    }

    fn on_offer_ready(&mut self, peer: &str, negotiated: Negotiated) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        entry.attach(negotiated.link);
        let held = entry.negotiator.offer_created();
        send_envelope(&self.relay, Envelope::offer(peer, negotiated.description));
        for descriptor in held {
            send_envelope(&self.relay, Envelope::candidate(peer, descriptor));
        }
    }

    fn on_answer_ready(&mut self, peer: &str, negotiated: Negotiated) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        entry.attach(negotiated.link.clone());
        let (local, remote) = entry.negotiator.answer_created();
        send_envelope(&self.relay, Envelope::answer(peer, negotiated.description));
        for descriptor in local {
            send_envelope(&self.relay, Envelope::candidate(peer, descriptor));
        }
        apply_remote_descriptors(peer, negotiated.link, remote);
    }

    async fn on_link_event(&mut self, peer: &str, event: LinkEvent) {
        match event {
            LinkEvent::LocalDescriptor(raw) => {
                if let Some(entry) = self.peers.get_mut(peer) {
                    if let Some(raw) = entry.negotiator.local_descriptor(raw) {
                        send_envelope(&self.relay, Envelope::candidate(peer, raw));
                    }
                }
            }
            LinkEvent::ConnectionState(state) => {
                debug!("Connection to {} is {:?}", peer, state);
                self.emit(SessionEvent::PeerStateChanged {
                    peer_id: peer.to_string(),
                    state,
                })
                .await;
                if state.is_terminal() {
                    if let Some(entry) = self.peers.get_mut(peer) {
                        entry.negotiator.failed();
                    }
                    self.drop_peer(peer, &format!("connection {:?}", state).to_lowercase())
                        .await;
                }
            }
            LinkEvent::ChannelOpen => {
                let Some(entry) = self.peers.get_mut(peer) else {
                    return;
                };
                entry.negotiator.channel_opened();
                info!("Channel to {} open", peer);
                self.emit(SessionEvent::PeerReady {
                    peer_id: peer.to_string(),
                })
                .await;
                if let Some(share) = &self.share {
                    self.peers.send_metadata(peer, &share.metadata());
                }
            }
            LinkEvent::ChannelClosed => self.drop_peer(peer, "channel closed").await,
            LinkEvent::Text(text) => self.on_frame(peer, Frame::from_text(&text)).await,
            LinkEvent::Binary(data) => self.on_frame(peer, Frame::from_binary(data)).await,
        }
    }

    async fn on_frame(&mut self, peer: &str, frame: Frame) {
        match (self.session.role(), frame) {
            (Role::Sender, Frame::Control(ControlFrame::SendFileRequest { password })) => {
                self.on_download_request(peer, password).await
            }
            (Role::Sender, Frame::Control(ControlFrame::FileReceived)) => {
                self.on_receipt(peer).await
            }
            (Role::Receiver, Frame::Control(ControlFrame::FileMetadata(metadata))) => {
                let Some(download) = self.peers.get_mut(peer).and_then(|e| e.download_mut())
                else {
                    return;
                };
                match download.load_metadata(metadata.clone()) {
                    Ok(()) => {
                        info!("Metadata from {}: {} ({} bytes)", peer, metadata.name, metadata.size);
                        self.emit(SessionEvent::MetadataReceived(metadata)).await;
                    }
                    Err(SessionError::TransferActive) => {
                        warn!("Metadata from {} during a transfer, ignoring", peer)
                    }
                    Err(e) => {
                        warn!("Refusing file offer from {}: {}", peer, e);
                        self.emit(SessionEvent::Error(format!("Refused file offer: {}", e)))
                            .await;
                    }
                }
            }
            (Role::Receiver, Frame::Control(ControlFrame::PasswordIncorrect)) => {
                self.on_rejected(peer, RequestRejection::PasswordIncorrect).await
            }
            (Role::Receiver, Frame::Control(ControlFrame::DownloadLimitReached)) => {
                self.on_rejected(peer, RequestRejection::DownloadLimitReached)
                    .await
            }
            (Role::Receiver, Frame::Chunk(data)) => self.on_chunk(peer, data).await,
            (_, Frame::Control(frame)) => {
                warn!("Unexpected {} frame from {}, ignoring", frame.kind(), peer)
            }
            (_, Frame::Chunk(data)) => {
                warn!("Unexpected {} byte frame from {}, ignoring", data.len(), peer)
            }
            (_, Frame::Unrecognized(reason)) => {
                warn!("Unrecognized text frame from {} ({}), ignoring", peer, reason)
            }
        }
    }

    // ---- sender side ----

    fn release_slot(&mut self) {
        if let Some(share) = self.share.as_mut() {
            share.release();
        }
    }

    async fn on_download_request(&mut self, peer: &str, password: Option<String>) {
        let generation = self.share_generation;
        let Some(share) = self.share.as_mut() else {
            warn!("Request from {} with nothing shared", peer);
            return;
        };
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        let Some(state) = entry.outgoing_mut() else {
            return;
        };

        match share.admit_request(state, password.as_deref()) {
            RequestDecision::Ignore => {}
            RequestDecision::Reject(rejection) => {
                info!("Refused request from {}: {}", peer, rejection);
                entry.send(Outbound::Control(rejection.reply()));
                self.emit(SessionEvent::RequestRejected {
                    peer_id: peer.to_string(),
                    rejection,
                })
                .await;
            }
            RequestDecision::Start => {
                let state = state.clone();
                entry.reserved = true;
                entry.share_generation = generation;
                info!("Streaming {} bytes to {}", state.total_size, peer);
                if state.total_size > 0 {
                    entry.send(Outbound::Stream(share.file().data.clone()));
                }
                self.emit_progress(peer, &state, true).await;
            }
        }
    }

    async fn on_chunk_sent(&mut self, peer: &str, offset: u64) {
        let Some(state) = self.peers.get_mut(peer).and_then(|e| e.outgoing_mut()) else {
            return;
        };
        if state.advance(offset).is_some() {
            let state = state.clone();
            self.emit_progress(peer, &state, true).await;
        }
    }

    async fn on_receipt(&mut self, peer: &str) {
        let generation = self.share_generation;
        let Some(share) = self.share.as_mut() else {
            return;
        };
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        let stale = entry.share_generation != generation;
        let Some(state) = entry.outgoing_mut() else {
            return;
        };

        if stale && state.is_active() {
            // Finished a file that has since been replaced; offer the current one
            warn!("{} confirmed a file that is no longer shared, not counted", peer);
            state.reset();
            let metadata = share.metadata();
            self.peers.send_metadata(peer, &metadata);
            return;
        }

        let before = state.progress_percent;
        let Some(downloads) = share.confirm_receipt(state) else {
            warn!("file-received from {} outside a transfer, ignoring", peer);
            return;
        };
        let finished = state.clone();
        if self.options.completion == CompletionPolicy::ResetPeer {
            state.reset();
        }
        entry.reserved = false;

        info!("{} confirmed receipt ({} download(s) total)", peer, downloads);
        if before < 100 {
            self.emit_progress(peer, &finished, true).await;
        }
        self.emit(SessionEvent::TransferCompleted {
            peer_id: peer.to_string(),
            downloads,
        })
        .await;

        if self.options.completion == CompletionPolicy::ClosePeer {
            self.drop_peer(peer, "transfer complete").await;
        }
    }

    // ---- receiver side ----

    async fn on_rejected(&mut self, peer: &str, rejection: RequestRejection) {
        let applied = self
            .peers
            .get_mut(peer)
            .and_then(|e| e.download_mut())
            .is_some_and(|d| d.on_rejected(rejection == RequestRejection::DownloadLimitReached));
        if !applied {
            warn!("{} refused a request that already completed", peer);
        }
        info!("{} refused the request: {}", peer, rejection);
        self.emit(SessionEvent::DownloadRejected(rejection)).await;
    }

    async fn on_chunk(&mut self, peer: &str, data: Bytes) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        let Some(download) = entry.download_mut() else {
            return;
        };

        match download.on_chunk(data) {
            ChunkOutcome::Ignored | ChunkOutcome::Progress(None) => {}
            ChunkOutcome::Progress(Some(_)) => {
                let state = download.state().clone();
                self.emit_progress(peer, &state, false).await;
            }
            ChunkOutcome::Complete(file) => {
                let state = download.state().clone();
                entry.send(Outbound::Control(ControlFrame::FileReceived));
                self.emit_progress(peer, &state, false).await;
                self.deliver(file).await;
            }
        }
    }

    async fn deliver(&mut self, file: ReceivedFile) {
        info!(
            "Received {} ({} bytes)",
            file.metadata.name,
            file.data.len()
        );
        self.emit(SessionEvent::FileReceived(file.clone())).await;

        if let Some(dir) = self.options.save_dir.clone() {
            let events = self.event_tx.clone();
            tokio::spawn(async move {
                let event = match file.save_to(&dir).await {
                    Ok(path) => SessionEvent::FileSaved { path },
                    Err(e) => {
                        error!("Could not save {}: {:#}", file.metadata.name, e);
                        SessionEvent::Error(format!("Could not save file: {:#}", e))
                    }
                };
                let _ = events.send(event).await;
            });
        }
    }

    // ---- shared ----

    /// Progress is also in the snapshot, so it is dropped rather than
    /// stalling the loop when nobody drains the event stream.
    async fn emit_progress(&self, peer: &str, state: &TransferState, is_sending: bool) {
        let event = SessionEvent::TransferProgress {
            peer_id: peer.to_string(),
            percent: state.progress_percent,
            offset: state.offset,
            total: state.total_size,
            is_sending,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.event_tx.try_send(event) {
            debug!("Event queue full, progress for {} dropped", peer);
        }
    }

    async fn drop_peer(&mut self, peer: &str, reason: &str) {
        let Some(reserved) = self.peers.remove(peer) else {
            return;
        };
        if reserved {
            self.release_slot();
        }
        info!("Link to {} removed: {}", peer, reason);
        self.emit(SessionEvent::PeerLeft {
            peer_id: peer.to_string(),
            reason: reason.to_string(),
        })
        .await;
    }

    fn publish(&self) {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .peers()
            .map(|e| PeerSnapshot {
                peer_id: e.peer.clone(),
                negotiation: e.negotiator.state(),
                channel: e.negotiator.channel_state(),
                is_ready: e.is_ready(),
                transfer: e.transfer.state().clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        let metadata = match &self.share {
            Some(share) => Some(share.metadata()),
            None => self.peers.peers().find_map(|e| match &e.transfer {
                PeerTransfer::Incoming(download) => download.metadata().cloned(),
                PeerTransfer::Outgoing(_) => None,
            }),
        };

        let snapshot = SessionSnapshot {
            role: self.session.role(),
            phase: self.session.phase(),
            session_id: self.session.id().map(str::to_string),
            relay_connected: self.session.relay_connected(),
            metadata,
            downloads: self.share.as_ref().map_or(0, Share::downloads),
            peers,
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}
