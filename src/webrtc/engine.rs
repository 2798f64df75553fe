//! Negotiation engine capability interface
//!
//! [`PeerSession`](super::peer::PeerSession) drives the handshake only through
//! these traits. The production implementation lives in [`super::rtc`] and
//! wraps `webrtc-rs`; tests substitute a scripted engine.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::config::VideoCodec;
use super::signaling::{ConnectionState, IceCandidate, SessionDescription};
use crate::error::Result;

/// Called for each locally gathered ICE candidate, `None` once gathering ends
pub type OnIceCandidateFn =
    Box<dyn FnMut(Option<IceCandidate>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called on every peer connection state change
pub type OnStateChangeFn = Box<dyn FnMut(ConnectionState) -> BoxFuture<'static, ()> + Send + Sync>;

/// Codec and identity of an outbound track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSpec {
    pub codec: VideoCodec,
    pub clock_rate: u32,
    pub track_id: String,
    pub stream_id: String,
}

/// Factory for peer connections and outbound tracks
#[async_trait]
pub trait NegotiationEngine: Send + Sync + 'static {
    type Track: OutboundTrack;
    type Connection: EngineConnection<Track = Self::Track>;

    /// Create a new, unconfigured peer connection
    async fn new_connection(&self, session_id: &str) -> Result<Self::Connection>;

    /// Create an outbound track that is not yet attached to any connection
    fn new_outbound_track(&self, spec: &TrackSpec) -> Result<Arc<Self::Track>>;
}

/// One negotiated peer connection
#[async_trait]
pub trait EngineConnection: Send + Sync + 'static {
    type Track: OutboundTrack;
    type Feedback: FeedbackSource;

    /// Attach a track as a send-only sender, returning the sender's feedback channel
    async fn add_track(&self, track: Arc<Self::Track>) -> Result<Self::Feedback>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn on_ice_candidate(&self, handler: OnIceCandidateFn);

    fn on_connection_state_change(&self, handler: OnStateChangeFn);

    async fn close(&self) -> Result<()>;
}

/// Write side of an outbound media track
#[async_trait]
pub trait OutboundTrack: Send + Sync + 'static {
    /// Write one marshalled RTP packet
    async fn write(&self, packet: &[u8]) -> Result<usize>;
}

/// Sender feedback (RTCP) channel that must be drained
#[async_trait]
pub trait FeedbackSource: Send + Sync + 'static {
    /// Read the next feedback batch into `buf`; errors once the sender is closed
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;
}
