//! WebRTC implementation of the peer link seam.
//!
//! Each peer gets its own `RTCPeerConnection` with one ordered data channel.
//! Descriptions travel as `RTCSessionDescription` JSON and trickled
//! candidates as `RTCIceCandidateInit` JSON.

mod connector;
mod link;

pub use connector::RtcConnector;
pub use link::RtcLink;

use anyhow::{Context, Result};
use peerdrop_core::ConnectivityState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Label of the single data channel both sides use
pub const CHANNEL_LABEL: &str = "fileTransfer";

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// One STUN/TURN entry per configured URL; the public STUN server when none are set
pub fn ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    let urls: Vec<&str> = urls
        .iter()
        .map(|u| u.trim())
        .filter(|u| !u.is_empty())
        .collect();
    let urls = if urls.is_empty() {
        vec![DEFAULT_ICE_SERVER]
    } else {
        urls
    };
    urls.into_iter()
        .map(|url| RTCIceServer {
            urls: vec![url.to_string()],
            ..Default::default()
        })
        .collect()
}

pub fn connectivity(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectivityState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectivityState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectivityState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

pub fn encode_description(description: &RTCSessionDescription) -> Result<String> {
    serde_json::to_string(description).context("encode session description")
}

pub fn decode_description(raw: &str) -> Result<RTCSessionDescription> {
    serde_json::from_str(raw).context("decode session description")
}

pub fn encode_candidate(candidate: &RTCIceCandidate) -> Result<String> {
    let init = candidate.to_json().context("candidate to json")?;
    serde_json::to_string(&init).context("encode candidate")
}

pub fn decode_candidate(raw: &str) -> Result<RTCIceCandidateInit> {
    serde_json::from_str(raw).context("decode candidate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    #[test]
    fn test_ice_servers_default_and_custom() {
        let servers = ice_servers(&[]);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec![DEFAULT_ICE_SERVER.to_string()]);

        let servers = ice_servers(&[
            "stun:stun1.l.google.com:19302".to_string(),
            "  ".to_string(),
            "turn:turn.example.com:3478".to_string(),
        ]);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].urls, vec!["turn:turn.example.com:3478".to_string()]);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            connectivity(RTCPeerConnectionState::Connected),
            Some(ConnectivityState::Connected)
        );
        assert_eq!(
            connectivity(RTCPeerConnectionState::Failed),
            Some(ConnectivityState::Failed)
        );
        assert_eq!(connectivity(RTCPeerConnectionState::Unspecified), None);
        assert!(connectivity(RTCPeerConnectionState::Disconnected)
            .is_some_and(ConnectivityState::is_terminal));
    }

    #[test]
    fn test_candidate_json_shape() {
        let raw = r#"{"candidate":"candidate:1 1 udp 2122260223 192.168.1.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let init = decode_candidate(raw).unwrap();
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
        assert!(init.candidate.contains("typ host"));

        assert!(decode_candidate("not json").is_err());
    }

    #[test]
    fn test_description_json_shape() {
        let raw = r#"{"type":"offer","sdp":"v=0\r\n"}"#;
        let description = decode_description(raw).unwrap();
        assert_eq!(description.sdp_type, RTCSdpType::Offer);
        assert_eq!(description.sdp, "v=0\r\n");

        let encoded = encode_description(&description).unwrap();
        assert!(encoded.contains(r#""type":"offer""#));
        assert!(decode_description(r#"{"sdp":"v=0"}"#).is_err());
    }
}
