//! The seam between the session loop and a concrete connectivity stack.
//!
//! A [`Connector`] runs the offer/answer half of a negotiation and hands back a
//! [`DataLink`]. Everything the link observes afterwards (local descriptors,
//! state changes, channel open/close, inbound messages) is pushed through the
//! [`LinkEventSink`] it was given, tagged with the peer id and epoch of the
//! entry that owns it.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;

pub type PeerId = String;

/// Transport-level connection state, as reported by the connectivity stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// States that end the link
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::Failed | ConnectivityState::Closed
        )
    }
}

/// Something the link observed
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A local connectivity descriptor to relay to the remote peer
    LocalDescriptor(String),
    ConnectionState(ConnectivityState),
    ChannelOpen,
    ChannelClosed,
    /// A text message; control frames travel this way
    Text(String),
    /// A binary message; always file content
    Binary(Bytes),
}

/// Result of one side of the description exchange
pub struct Negotiated {
    pub link: Arc<dyn DataLink>,
    /// Opaque local description (offer or answer) for the relay
    pub description: String,
}

pub trait Connector: Send + Sync {
    /// Initiator: build a connection with one ordered channel and produce an offer.
    fn create_offer(&self, peer: PeerId, events: LinkEventSink) -> BoxFuture<'_, Result<Negotiated>>;

    /// Responder: apply the remote offer and produce an answer.
    fn accept_offer(
        &self,
        peer: PeerId,
        offer: String,
        events: LinkEventSink,
    ) -> BoxFuture<'_, Result<Negotiated>>;
}

pub trait DataLink: Send + Sync {
    fn apply_answer(&self, answer: String) -> BoxFuture<'_, Result<()>>;
    fn add_remote_descriptor(&self, descriptor: String) -> BoxFuture<'_, Result<()>>;
    fn send_text(&self, text: String) -> BoxFuture<'_, Result<()>>;
    /// Resolves once the chunk has been handed to the transport
    fn send_binary(&self, data: Bytes) -> BoxFuture<'_, Result<()>>;
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Inputs that re-enter the session loop for one peer entry
pub(crate) enum PeerInput {
    Link(LinkEvent),
    OfferReady(Negotiated),
    AnswerReady(Negotiated),
    RemoteDescriptionApplied,
    NegotiationFailed(String),
    ChunkSent { offset: u64 },
    SendFailed(String),
}

pub(crate) struct PeerMessage {
    pub peer: PeerId,
    pub epoch: u64,
    pub input: PeerInput,
}

/// Where a link reports its events; stamped with the owning entry's epoch
#[derive(Clone)]
pub struct LinkEventSink {
    peer: PeerId,
    epoch: u64,
    tx: mpsc::UnboundedSender<PeerMessage>,
}

impl LinkEventSink {
    pub(crate) fn new(peer: PeerId, epoch: u64, tx: mpsc::UnboundedSender<PeerMessage>) -> Self {
        Self { peer, epoch, tx }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn emit(&self, event: LinkEvent) {
        self.post(PeerInput::Link(event));
    }

    /// False once the session loop has gone away
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    pub(crate) fn post(&self, input: PeerInput) {
        let _ = self.tx.send(PeerMessage {
            peer: self.peer.clone(),
            epoch: self.epoch,
            input,
        });
    }
}
