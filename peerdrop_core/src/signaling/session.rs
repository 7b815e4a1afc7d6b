use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::envelope::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Disconnected,
    RelayConnected,
    SessionCreated,
    SessionJoined,
    Closed,
}

/// Local view of the session: who we are and how far the relay handshake got
#[derive(Debug)]
pub struct Session {
    role: Role,
    phase: SessionPhase,
    id: Option<String>,
    /// Receiver: the session we asked to join
    pending_join: Option<String>,
}

impl Session {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phase: SessionPhase::Disconnected,
            id: None,
            pending_join: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn relay_connected(&self) -> bool {
        !matches!(
            self.phase,
            SessionPhase::Disconnected | SessionPhase::Closed
        )
    }

    pub fn on_relay_connected(&mut self) {
        if self.phase == SessionPhase::Disconnected {
            self.phase = SessionPhase::RelayConnected;
        }
    }

    /// Ask the relay for a session id. Logged and dropped if the relay is not up yet.
    pub fn create(&mut self, relay: &mpsc::UnboundedSender<Envelope>) -> bool {
        if !self.relay_connected() {
            warn!("Cannot create session: relay not connected");
            return false;
        }
        relay.send(Envelope::create_session()).is_ok()
    }

    pub fn on_session_created(&mut self, id: &str) -> bool {
        if self.role != Role::Sender || !self.relay_connected() {
            warn!("Unexpected session_created for {}", id);
            return false;
        }
        info!("Session created: {}", id);
        self.id = Some(id.to_string());
        self.phase = SessionPhase::SessionCreated;
        true
    }

    /// Ask to join `remote`. No peer link exists until its offer arrives.
    pub fn join(&mut self, remote: &str, relay: &mpsc::UnboundedSender<Envelope>) -> bool {
        if !self.relay_connected() {
            warn!("Cannot join {}: relay not connected", remote);
            return false;
        }
        self.pending_join = Some(remote.to_string());
        relay.send(Envelope::join_session(remote)).is_ok()
    }

    /// Receiver: whether an offer from `from` belongs to the session we joined.
    /// The first one confirms the join.
    pub fn accept_offer_from(&mut self, from: &str) -> bool {
        if self.role != Role::Receiver || self.pending_join.as_deref() != Some(from) {
            return false;
        }
        if self.phase == SessionPhase::RelayConnected {
            info!("Joined session {}", from);
            self.id = Some(from.to_string());
            self.phase = SessionPhase::SessionJoined;
        }
        self.phase == SessionPhase::SessionJoined
    }

    pub fn on_relay_closed(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }
}
