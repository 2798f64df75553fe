//! WebRTC signaling types and messages

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Named events exchanged over the signal channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalEvent {
    /// SDP offer, server to viewer only
    Offer,
    /// SDP answer, viewer to server
    Answer,
    /// Trickled ICE candidate, both directions
    Candidate,
    /// Reason string for a refused message
    Reject,
    /// Reason string for a closed session, both directions
    Close,
}

impl SignalEvent {
    pub const ALL: [SignalEvent; 5] = [
        SignalEvent::Offer,
        SignalEvent::Answer,
        SignalEvent::Candidate,
        SignalEvent::Reject,
        SignalEvent::Close,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalEvent::Offer => "offer",
            SignalEvent::Answer => "answer",
            SignalEvent::Candidate => "candidate",
            SignalEvent::Reject => "reject",
            SignalEvent::Close => "close",
        }
    }
}

impl std::fmt::Display for SignalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason strings carried by `close` and `reject` events
pub mod reason {
    pub const OK: &str = "ok";
    pub const UNEXPECTED_OFFER: &str = "unexpected offer";
    pub const MISBEHAVING_HOST: &str = "misbehaving host";
    pub const INVALID_ANSWER: &str = "invalid answer";
    pub const PARSE_ANSWER: &str = "failed to parse answer";
    pub const ADD_ANSWER: &str = "failed to add answer";
    pub const INVALID_CANDIDATE: &str = "invalid candidate";
    pub const PARSE_CANDIDATE: &str = "failed to parse candidate";
    pub const ADD_CANDIDATE: &str = "failed to add candidate";
    pub const SEND_CANDIDATE: &str = "failed to send candidate";
    pub const CREATE_CONNECTION: &str = "failed to create peer connection";
    pub const CREATE_TRACK: &str = "failed to create track";
    pub const ADD_TRACK: &str = "failed to add track";
    pub const CREATE_OFFER: &str = "failed to create offer";
    pub const ADD_OFFER: &str = "failed to add offer";
    pub const SEND_OFFER: &str = "failed to send offer";
    pub const READ_STREAM: &str = "failed to read stream";
    pub const WRITE_TRACK: &str = "failed to write track";
    pub const REJECTED: &str = "rejected by peer";
    pub const CONNECTION_FAILED: &str = "connection failed";
    pub const CONNECTION_CLOSED: &str = "connection closed";
    pub const SIGNALING_CLOSED: &str = "signaling closed";
    pub const SERVER_FULL: &str = "server full";
    pub const SHUTTING_DOWN: &str = "server shutting down";
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description exchanged during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap a viewer's answer, refusing text that is not SDP
    pub fn answer(sdp: impl Into<String>) -> Result<Self, String> {
        let sdp = sdp.into();
        if !sdp.trim_start().starts_with("v=") {
            return Err("answer does not start with a version line".to_string());
        }
        Ok(Self {
            sdp_type: SdpType::Answer,
            sdp,
        })
    }
}

/// ICE candidate, in the browser's `RTCIceCandidateInit` JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }

    pub fn into_init(self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate,
            sdp_mid: self.sdp_mid,
            sdp_mline_index: self.sdp_mline_index,
            username_fragment: self.username_fragment,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

/// Peer connection state reported by the negotiation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}
