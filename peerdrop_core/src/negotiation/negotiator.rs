use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Negotiation progress of one peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NegotiationState {
    Idle,
    OfferCreated,
    OfferReceived,
    AnswerExchanged,
    Connecting,
    Open,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelState {
    Negotiating,
    Open,
    Closed,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescriptorFields {
    candidate: String,
    #[serde(default)]
    sdp_mid: Option<String>,
    #[serde(default)]
    sdp_m_line_index: Option<u16>,
}

/// Canonical `candidate:sdpMid:sdpMLineIndex` key for a serialized descriptor.
/// Anything that is not a descriptor object keys on its raw text.
pub fn descriptor_key(raw: &str) -> String {
    match serde_json::from_str::<DescriptorFields>(raw) {
        Ok(d) => format!(
            "{}:{}:{}",
            d.candidate,
            d.sdp_mid.unwrap_or_default(),
            d.sdp_m_line_index.map(|i| i.to_string()).unwrap_or_default()
        ),
        Err(_) => raw.to_string(),
    }
}

/// Offer/answer bookkeeping for one peer.
///
/// Local descriptors are held until our own description has gone out, remote
/// ones are queued until the remote description has been applied. Methods
/// return what the caller should forward now.
#[derive(Debug)]
pub struct Negotiator {
    state: NegotiationState,
    local_described: bool,
    remote_described: bool,
    sent: HashSet<String>,
    held_local: Vec<String>,
    queued_remote: Vec<String>,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiator {
    pub fn new() -> Self {
        Self {
            state: NegotiationState::Idle,
            local_described: false,
            remote_described: false,
            sent: HashSet::new(),
            held_local: Vec::new(),
            queued_remote: Vec::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn channel_state(&self) -> ChannelState {
        match self.state {
            NegotiationState::Open => ChannelState::Open,
            NegotiationState::Closed | NegotiationState::Failed => ChannelState::Closed,
            _ => ChannelState::Negotiating,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == NegotiationState::Open
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.state,
            NegotiationState::Closed | NegotiationState::Failed
        )
    }

    /// Initiator: our offer is about to be relayed. Returns held descriptors to follow it.
    pub fn offer_created(&mut self) -> Vec<String> {
        if self.state != NegotiationState::Idle {
            return Vec::new();
        }
        self.state = NegotiationState::OfferCreated;
        self.local_described = true;
        std::mem::take(&mut self.held_local)
    }

    /// Responder: an offer arrived for this link
    pub fn offer_received(&mut self) -> bool {
        if self.state != NegotiationState::Idle {
            return false;
        }
        self.state = NegotiationState::OfferReceived;
        true
    }

    /// Responder: the offer is applied and our answer is about to be relayed.
    /// Returns `(held local descriptors, queued remote descriptors)`.
    pub fn answer_created(&mut self) -> (Vec<String>, Vec<String>) {
        if self.state != NegotiationState::OfferReceived {
            return (Vec::new(), Vec::new());
        }
        self.state = NegotiationState::Connecting;
        self.local_described = true;
        self.remote_described = true;
        (
            std::mem::take(&mut self.held_local),
            std::mem::take(&mut self.queued_remote),
        )
    }

    /// Initiator: the answer arrived. False if we were not waiting for one.
    pub fn answer_received(&mut self) -> bool {
        if self.state != NegotiationState::OfferCreated {
            return false;
        }
        self.state = NegotiationState::AnswerExchanged;
        true
    }

    /// Initiator: the answer is applied. Returns remote descriptors queued meanwhile.
    pub fn remote_description_applied(&mut self) -> Vec<String> {
        if self.state != NegotiationState::AnswerExchanged {
            return Vec::new();
        }
        self.state = NegotiationState::Connecting;
        self.remote_described = true;
        std::mem::take(&mut self.queued_remote)
    }

    /// A local descriptor appeared. Returns it if it should be relayed now.
    pub fn local_descriptor(&mut self, raw: String) -> Option<String> {
        if self.is_finished() || !self.sent.insert(descriptor_key(&raw)) {
            return None;
        }
        if !self.local_described {
            self.held_local.push(raw);
            return None;
        }
        Some(raw)
    }

    /// A remote descriptor arrived. Returns it if it can be applied now.
    pub fn remote_descriptor(&mut self, raw: String) -> Option<String> {
        if self.is_finished() {
            return None;
        }
        if !self.remote_described {
            self.queued_remote.push(raw);
            return None;
        }
        Some(raw)
    }

    pub fn channel_opened(&mut self) {
        if !self.is_finished() {
            self.state = NegotiationState::Open;
        }
    }

    pub fn closed(&mut self) {
        if self.state != NegotiationState::Failed {
            self.state = NegotiationState::Closed;
        }
    }

    pub fn failed(&mut self) {
        self.state = NegotiationState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(addr: &str) -> String {
        format!(
            r#"{{"candidate":"candidate:1 1 udp 2122260223 {} typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
            addr
        )
    }

    #[test]
    fn test_descriptor_key_fields() {
        assert_eq!(
            descriptor_key(&candidate("10.0.0.1 5000")),
            "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host:0:0"
        );
        // Field order and extra fields do not matter
        assert_eq!(
            descriptor_key(r#"{"sdpMLineIndex":1,"usernameFragment":"u","candidate":"c","sdpMid":"a"}"#),
            "c:a:1"
        );
        assert_eq!(descriptor_key("opaque"), "opaque");
    }

    #[test]
    fn test_initiator_holds_descriptors_until_offer() {
        let mut n = Negotiator::new();
        assert_eq!(n.local_descriptor(candidate("a 1")), None);
        assert_eq!(n.local_descriptor(candidate("a 1")), None);
        assert_eq!(n.local_descriptor(candidate("b 2")), None);

        let flushed = n.offer_created();
        assert_eq!(flushed, vec![candidate("a 1"), candidate("b 2")]);
        assert_eq!(n.state(), NegotiationState::OfferCreated);

        assert_eq!(n.local_descriptor(candidate("c 3")), Some(candidate("c 3")));
        assert_eq!(n.local_descriptor(candidate("c 3")), None);
    }

    #[test]
    fn test_initiator_queues_remote_until_answer_applied() {
        let mut n = Negotiator::new();
        n.offer_created();
        assert_eq!(n.remote_descriptor(candidate("r 1")), None);
        assert!(n.answer_received());
        assert_eq!(n.remote_descriptor(candidate("r 2")), None);

        let queued = n.remote_description_applied();
        assert_eq!(queued, vec![candidate("r 1"), candidate("r 2")]);
        assert_eq!(n.state(), NegotiationState::Connecting);
        assert_eq!(n.remote_descriptor(candidate("r 3")), Some(candidate("r 3")));
    }

    #[test]
    fn test_responder_flow() {
        let mut n = Negotiator::new();
        assert!(n.offer_received());
        assert!(!n.offer_received());
        n.remote_descriptor(candidate("r 1"));
        n.local_descriptor(candidate("l 1"));

        let (local, remote) = n.answer_created();
        assert_eq!(local, vec![candidate("l 1")]);
        assert_eq!(remote, vec![candidate("r 1")]);
        assert_eq!(n.channel_state(), ChannelState::Negotiating);

        n.channel_opened();
        assert!(n.is_ready());
        assert_eq!(n.channel_state(), ChannelState::Open);
    }

    #[test]
    fn test_unexpected_answer_ignored() {
        let mut n = Negotiator::new();
        assert!(!n.answer_received());
        n.offer_received();
        assert!(!n.answer_received());
        assert_eq!(n.state(), NegotiationState::OfferReceived);
    }

    #[test]
    fn test_failed_link_stops_forwarding() {
        let mut n = Negotiator::new();
        n.offer_created();
        n.failed();
        n.closed();
        assert_eq!(n.state(), NegotiationState::Failed);
        assert_eq!(n.channel_state(), ChannelState::Closed);
        assert_eq!(n.local_descriptor(candidate("x 1")), None);
        n.channel_opened();
        assert!(!n.is_ready());
    }
}
