use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CreateSession,
    JoinSession,
    SessionCreated,
    PeerJoined,
    PeerLeft,
    Offer,
    Answer,
    Candidate,
    Error,
}

/// One relay message. `sdp` and `candidate` are opaque to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
}

impl Envelope {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            session_id: None,
            target: None,
            sdp: None,
            candidate: None,
        }
    }

    pub fn create_session() -> Self {
        Self::new(Action::CreateSession)
    }

    pub fn join_session(target: &str) -> Self {
        Self {
            target: Some(target.to_string()),
            ..Self::new(Action::JoinSession)
        }
    }

    pub fn session_created(id: &str) -> Self {
        Self {
            session_id: Some(id.to_string()),
            ..Self::new(Action::SessionCreated)
        }
    }

    pub fn offer(target: &str, sdp: String) -> Self {
        Self {
            target: Some(target.to_string()),
            sdp: Some(sdp),
            ..Self::new(Action::Offer)
        }
    }

    pub fn answer(target: &str, sdp: String) -> Self {
        Self {
            target: Some(target.to_string()),
            sdp: Some(sdp),
            ..Self::new(Action::Answer)
        }
    }

    pub fn candidate(target: &str, candidate: String) -> Self {
        Self {
            target: Some(target.to_string()),
            candidate: Some(candidate),
            ..Self::new(Action::Candidate)
        }
    }

    pub fn peer_left(id: &str) -> Self {
        Self {
            session_id: Some(id.to_string()),
            ..Self::new(Action::PeerLeft)
        }
    }

    /// Error envelopes carry their message in `sdp`
    pub fn error(message: &str) -> Self {
        Self {
            sdp: Some(message.to_string()),
            ..Self::new(Action::Error)
        }
    }

    /// `session_id`, treating the empty string some relays send as absent
    pub fn session(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|s| !s.is_empty())
    }

    pub fn target_id(&self) -> Option<&str> {
        self.target.as_deref().filter(|s| !s.is_empty())
    }

    pub fn error_message(&self) -> &str {
        self.sdp.as_deref().unwrap_or("unknown relay error")
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_wire_form() {
        assert_eq!(
            Envelope::create_session().to_json().unwrap(),
            r#"{"action":"create_session"}"#
        );
        assert_eq!(
            Envelope::join_session("abc").to_json().unwrap(),
            r#"{"action":"join_session","target":"abc"}"#
        );
    }

    #[test]
    fn test_parses_relay_messages() {
        let env = Envelope::from_json(r#"{"action":"peer_joined","session_id":"r1","target":"s1"}"#)
            .unwrap();
        assert_eq!(env.action, Action::PeerJoined);
        assert_eq!(env.session_id.as_deref(), Some("r1"));

        let err = Envelope::from_json(
            r#"{"action":"error","sdp":"File not found, please try again later."}"#,
        )
        .unwrap();
        assert_eq!(err.error_message(), "File not found, please try again later.");

        let blank = Envelope::from_json(r#"{"action":"session_created","session_id":"","target":""}"#)
            .unwrap();
        assert_eq!(blank.session(), None);
        assert_eq!(blank.target_id(), None);

        assert!(Envelope::from_json(r#"{"action":"bogus"}"#).is_err());
        assert!(Envelope::from_json("not json").is_err());
    }
}
