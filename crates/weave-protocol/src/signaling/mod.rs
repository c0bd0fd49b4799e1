//! WebRTC signaling relayed over the P2P message channel.
//!
//! Offers, answers, ICE candidates, hangups and rejections travel as
//! [`SignalingEnvelope`]s inside `WEBRTC_SIGNALING` wrapper messages. The
//! media stack itself is outside this crate; it consumes [`SignalingEvent`]s.

pub mod ice;
mod service;
pub mod state;

use serde::{Deserialize, Serialize};

pub use ice::{IceServer, IceServerConfig, DEFAULT_STUN_SERVERS};
pub use service::{SignalingConfig, SignalingEvent, SignalingService};
pub use state::PeerConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    Hangup,
    Reject,
}

/// `{type, data, fromDid}` where `data` depends on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub data: serde_json::Value,
    pub from_did: String,
}

/// Data of an `OFFER` or `ANSWER`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// `"offer"` or `"answer"`.
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
    pub sdp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hangup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_field_names() {
        let candidate = IceCandidate {
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            sdp: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn envelope_shape() {
        let envelope = SignalingEnvelope {
            signal_type: SignalType::IceCandidate,
            data: serde_json::json!({"sdp": "c"}),
            from_did: "did:key:zA".into(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "ICE_CANDIDATE");
        assert_eq!(json["fromDid"], "did:key:zA");
    }
}
