//! WebRTC side of the broadcast
//!
//! Architecture:
//! ```text
//! BroadcastHandle feed (RTP packets)
//!        |
//!        v
//! PeerSession (forwarding loop)
//!        |
//!        v
//! Outbound track (webrtc-rs TrackLocalStaticRTP)
//!        |
//! Browser <-------- Signal channel ------- PeerSession
//!                (offer/answer/candidate/close)
//! ```

pub mod config;
pub mod engine;
#[cfg(test)]
pub mod fake;
pub mod mdns;
pub mod peer;
pub mod rtc;
pub mod signaling;

pub use config::{TurnServer, VideoCodec, WebRtcConfig};
pub use engine::{EngineConnection, FeedbackSource, NegotiationEngine, OutboundTrack, TrackSpec};
pub use mdns::MdnsMode;
pub use peer::{PeerSession, SessionParams, SessionState};
pub use rtc::RtcEngine;
pub use signaling::{ConnectionState, IceCandidate, SessionDescription, SignalEvent};
