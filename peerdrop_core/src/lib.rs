use serde::Serialize;
use std::path::PathBuf;

pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod negotiation;
pub mod signaling;
pub mod transfer;

pub use coordinator::CompletionPolicy;
pub use driver::{SessionHandle, SessionOptions, run_session};
pub use error::{RequestRejection, SessionError};
pub use negotiation::link::{
    ConnectivityState, Connector, DataLink, LinkEvent, LinkEventSink, Negotiated, PeerId,
};
pub use negotiation::negotiator::{ChannelState, NegotiationState};
pub use signaling::relay::{RelayChannels, RelayEvent, connect_relay};
pub use signaling::session::{Role, SessionPhase};
pub use transfer::policy::{AccessPolicy, PasswordGate};
pub use transfer::progress::{TransferState, TransferStatus};
pub use transfer::protocol::FileMetadata;
pub use transfer::receiver::ReceivedFile;
pub use transfer::sender::SharedFile;

/// Commands from the front end to the session loop
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Sender: ask the relay for a session id
    CreateSession,
    /// Receiver: join a sender's session
    JoinSession { session_id: String },
    /// Sender: start (or replace) the share. Resets the download counter.
    ShareFile {
        file: SharedFile,
        policy: AccessPolicy,
    },
    /// Sender: (re)send metadata to one peer
    SendMetadata { peer_id: PeerId },
    /// Sender: send metadata to every ready peer
    BroadcastMetadata,
    /// Receiver: ask for the file
    RequestDownload { password: Option<String> },
    /// Tear down one peer link
    DisconnectPeer { peer_id: PeerId },
    Shutdown,
}

/// Reports from the session loop to the front end
#[derive(Debug, Clone)]
pub enum SessionEvent {
    RelayConnected,
    SessionCreated {
        session_id: String,
    },
    SessionJoined {
        session_id: String,
    },
    /// An `error` envelope from the relay, verbatim
    RelayError(String),

    PeerJoined {
        peer_id: PeerId,
    },
    PeerStateChanged {
        peer_id: PeerId,
        state: ConnectivityState,
    },
    /// The peer's channel is open
    PeerReady {
        peer_id: PeerId,
    },
    PeerLeft {
        peer_id: PeerId,
        reason: String,
    },

    /// Receiver: the sender described its file
    MetadataReceived(FileMetadata),
    TransferProgress {
        peer_id: PeerId,
        percent: u8,
        offset: u64,
        total: u64,
        is_sending: bool,
    },
    /// Sender: a request was refused
    RequestRejected {
        peer_id: PeerId,
        rejection: RequestRejection,
    },
    /// Receiver: the sender refused our request
    DownloadRejected(RequestRejection),
    /// Sender: a receiver confirmed the full file
    TransferCompleted {
        peer_id: PeerId,
        downloads: u32,
    },
    /// Receiver: the full file arrived
    FileReceived(ReceivedFile),
    FileSaved {
        path: PathBuf,
    },

    /// Sender: the share's lifetime ran out
    ShareExpired,
    Error(String),
    /// The loop has stopped
    SessionClosed {
        reason: String,
    },
}

/// Per-peer part of [`SessionSnapshot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub negotiation: NegotiationState,
    pub channel: ChannelState,
    pub is_ready: bool,
    pub transfer: TransferState,
}

/// Everything a front end needs to render the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub role: Role,
    pub phase: SessionPhase,
    pub session_id: Option<String>,
    pub relay_connected: bool,
    pub metadata: Option<FileMetadata>,
    pub downloads: u32,
    pub peers: Vec<PeerSnapshot>,
}

impl SessionSnapshot {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phase: SessionPhase::Disconnected,
            session_id: None,
            relay_connected: false,
            metadata: None,
            downloads: 0,
            peers: Vec::new(),
        }
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }
}
