//! Per-peer state for a session.
//!
//! Every remote peer gets its own entry holding its negotiator, transfer state,
//! link and writer. Entries carry an epoch; inputs stamped with an older epoch
//! are stale and must not touch the entry that replaced them.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::negotiation::link::{DataLink, LinkEventSink, PeerId, PeerMessage};
use crate::negotiation::negotiator::Negotiator;
use crate::transfer::outbox::{Outbound, Outbox};
use crate::transfer::progress::TransferState;
use crate::transfer::protocol::{ControlFrame, FileMetadata};
use crate::transfer::receiver::Download;

/// What the sender does with a peer once it confirms receipt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Keep the link, reset its transfer to idle
    #[default]
    ResetPeer,
    /// Tear the link down
    ClosePeer,
}

#[derive(Debug)]
pub enum PeerTransfer {
    Outgoing(TransferState),
    Incoming(Download),
}

impl PeerTransfer {
    pub fn state(&self) -> &TransferState {
        match self {
            PeerTransfer::Outgoing(state) => state,
            PeerTransfer::Incoming(download) => download.state(),
        }
    }
}

pub struct PeerEntry {
    pub peer: PeerId,
    pub epoch: u64,
    pub negotiator: Negotiator,
    pub transfer: PeerTransfer,
    /// Holds a download slot on the share
    pub reserved: bool,
    /// Generation of the share the current outgoing transfer streams
    pub share_generation: u64,
    sink: LinkEventSink,
    link: Option<Arc<dyn DataLink>>,
    outbox: Option<Outbox>,
    cancel: CancellationToken,
}

impl PeerEntry {
    pub fn sink(&self) -> LinkEventSink {
        self.sink.clone()
    }

    pub fn link(&self) -> Option<Arc<dyn DataLink>> {
        self.link.clone()
    }

    /// Install the negotiated link and start its writer
    pub fn attach(&mut self, link: Arc<dyn DataLink>) {
        self.outbox = Some(Outbox::spawn(
            link.clone(),
            self.sink.clone(),
            self.cancel.child_token(),
        ));
        self.link = Some(link);
    }

    pub fn is_ready(&self) -> bool {
        self.negotiator.is_ready() && self.outbox.is_some()
    }

    /// Queue a frame behind anything already queued for this peer
    pub fn send(&self, item: Outbound) -> bool {
        match &self.outbox {
            Some(outbox) if self.negotiator.is_ready() => outbox.send(item),
            _ => {
                warn!("Channel to {} not open, dropping {:?}", self.peer, item);
                false
            }
        }
    }

    pub fn outgoing_mut(&mut self) -> Option<&mut TransferState> {
        match &mut self.transfer {
            PeerTransfer::Outgoing(state) => Some(state),
            PeerTransfer::Incoming(_) => None,
        }
    }

    pub fn download_mut(&mut self) -> Option<&mut Download> {
        match &mut self.transfer {
            PeerTransfer::Incoming(download) => Some(download),
            PeerTransfer::Outgoing(_) => None,
        }
    }

    /// Stop the writer and close the link in the background
    fn teardown(mut self) {
        self.cancel.cancel();
        self.negotiator.closed();
        self.outbox = None;
        if let Some(link) = self.link.take() {
            let peer = self.peer.clone();
            tokio::spawn(async move {
                if let Err(e) = link.close().await {
                    debug!("Closing link to {}: {}", peer, e);
                }
            });
        }
    }
}

pub struct Coordinator {
    peers: HashMap<PeerId, PeerEntry>,
    next_epoch: u64,
    inputs: mpsc::UnboundedSender<PeerMessage>,
}

impl Coordinator {
    pub(crate) fn new(inputs: mpsc::UnboundedSender<PeerMessage>) -> Self {
        Self {
            peers: HashMap::new(),
            next_epoch: 1,
            inputs,
        }
    }

    /// Create a fresh entry for `peer`, tearing down any previous one.
    /// Returns the replaced entry's reservation flag.
    pub fn admit(&mut self, peer: &str, transfer: PeerTransfer) -> (&mut PeerEntry, bool) {
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let replaced_reservation = match self.peers.remove(peer) {
            Some(old) => {
                info!("Replacing link to {} (epoch {})", peer, old.epoch);
                let reserved = old.reserved;
                old.teardown();
                reserved
            }
            None => false,
        };

        let entry = PeerEntry {
            peer: peer.to_string(),
            epoch,
            negotiator: Negotiator::new(),
            transfer,
            reserved: false,
            share_generation: 0,
            sink: LinkEventSink::new(peer.to_string(), epoch, self.inputs.clone()),
            link: None,
            outbox: None,
            cancel: CancellationToken::new(),
        };
        let entry = self.peers.entry(peer.to_string()).or_insert(entry);
        (entry, replaced_reservation)
    }

    pub fn is_live(&self, peer: &str, epoch: u64) -> bool {
        self.peers.get(peer).is_some_and(|e| e.epoch == epoch)
    }

    pub fn get(&self, peer: &str) -> Option<&PeerEntry> {
        self.peers.get(peer)
    }

    pub fn get_mut(&mut self, peer: &str) -> Option<&mut PeerEntry> {
        self.peers.get_mut(peer)
    }

    /// Tear down one peer. Returns whether it held a reservation.
    pub fn remove(&mut self, peer: &str) -> Option<bool> {
        let entry = self.peers.remove(peer)?;
        let reserved = entry.reserved;
        entry.teardown();
        Some(reserved)
    }

    /// Tear down every peer
    pub fn clear(&mut self) -> usize {
        let count = self.peers.len();
        for (_, entry) in self.peers.drain() {
            entry.teardown();
        }
        count
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerEntry> {
        self.peers.values()
    }

    /// Forget every reservation, e.g. when the share they were made against is replaced
    pub fn clear_reservations(&mut self) {
        for entry in self.peers.values_mut() {
            entry.reserved = false;
        }
    }

    pub fn ready_peers(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|e| e.is_ready())
            .map(|e| e.peer.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Send metadata to one ready peer that is not mid-transfer
    pub fn send_metadata(&mut self, peer: &str, metadata: &FileMetadata) -> bool {
        let Some(entry) = self.peers.get_mut(peer) else {
            warn!("No link to {}, metadata not sent", peer);
            return false;
        };
        if !entry.is_ready() {
            debug!("Channel to {} not ready, metadata deferred", peer);
            return false;
        }
        let Some(state) = entry.outgoing_mut() else {
            return false;
        };
        if !state.metadata_sent(metadata.size) {
            debug!("Transfer to {} in progress, metadata not resent", peer);
            return false;
        }
        entry.send(Outbound::Control(ControlFrame::FileMetadata(metadata.clone())))
    }

    /// Send metadata to every ready peer. Returns the peers it went to.
    pub fn broadcast_metadata(&mut self, metadata: &FileMetadata) -> Vec<PeerId> {
        self.ready_peers()
            .into_iter()
            .filter(|peer| self.send_metadata(peer, metadata))
            .collect()
    }
}
