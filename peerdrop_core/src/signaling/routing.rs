//! Relay routing rules, independent of the socket layer.
//!
//! Each connected participant is registered under its session id. The router
//! turns one inbound envelope into the deliveries it causes; the caller owns
//! the actual connections.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use super::envelope::{Action, Envelope};

pub const SESSION_NOT_FOUND: &str = "File not found, please try again later.";
pub const OFFER_TARGET_MISSING: &str = "Peer not found, Please try again later.";
pub const FORWARD_TARGET_MISSING: &str = "Error connecting to peer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: String,
    pub envelope: Envelope,
}

impl Delivery {
    fn new(to: &str, envelope: Envelope) -> Self {
        Self {
            to: to.to_string(),
            envelope,
        }
    }
}

#[derive(Debug, Default)]
pub struct RelayRouter {
    /// id -> ids it has exchanged envelopes with
    members: HashMap<String, HashSet<String>>,
}

impl RelayRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &str) {
        self.members.entry(id.to_string()).or_default();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Drop a participant and tell everyone it talked to.
    pub fn unregister(&mut self, id: &str) -> Vec<Delivery> {
        let Some(contacts) = self.members.remove(id) else {
            return Vec::new();
        };
        contacts
            .into_iter()
            .filter_map(|contact| {
                let peers = self.members.get_mut(&contact)?;
                peers.remove(id);
                Some(Delivery::new(&contact, Envelope::peer_left(id)))
            })
            .collect()
    }

    pub fn route(&mut self, from: &str, envelope: Envelope) -> Vec<Delivery> {
        match envelope.action {
            Action::CreateSession => vec![Delivery::new(from, Envelope::session_created(from))],
            Action::JoinSession => {
                let Some(target) = self.live_target(&envelope) else {
                    return vec![Delivery::new(from, Envelope::error(SESSION_NOT_FOUND))];
                };
                self.link(from, &target);
                let joined = Envelope {
                    session_id: Some(from.to_string()),
                    target: Some(target.clone()),
                    ..Envelope::new(Action::PeerJoined)
                };
                vec![Delivery::new(&target, joined)]
            }
            Action::Offer | Action::Answer | Action::Candidate => {
                let Some(target) = self.live_target(&envelope) else {
                    let message = if envelope.action == Action::Offer {
                        OFFER_TARGET_MISSING
                    } else {
                        FORWARD_TARGET_MISSING
                    };
                    return vec![Delivery::new(from, Envelope::error(message))];
                };
                self.link(from, &target);
                debug!("Forwarding {:?} {} -> {}", envelope.action, from, target);
                let forwarded = Envelope {
                    session_id: Some(from.to_string()),
                    ..envelope
                };
                vec![Delivery::new(&target, forwarded)]
            }
            other => {
                warn!("Ignoring client-sent {:?} from {}", other, from);
                Vec::new()
            }
        }
    }

    fn live_target(&self, envelope: &Envelope) -> Option<String> {
        envelope
            .target_id()
            .filter(|t| self.contains(t))
            .map(str::to_string)
    }

    fn link(&mut self, a: &str, b: &str) {
        if a == b {
            return;
        }
        if let Some(contacts) = self.members.get_mut(a) {
            contacts.insert(b.to_string());
        }
        if let Some(contacts) = self.members.get_mut(b) {
            contacts.insert(a.to_string());
        }
    }
}
