use serde::{Deserialize, Serialize};

use crate::webrtc::config::{VideoCodec, WebRtcConfig};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// RTP ingest settings
    pub ingest: IngestConfig,
    /// Broadcast stream identity
    pub stream: StreamConfig,
    /// ICE / negotiation settings
    pub webrtc: WebRtcConfig,
    /// Viewer admission settings
    pub broadcast: BroadcastConfig,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port
    pub http_port: u16,
    /// Bind address
    pub bind_address: String,
    /// Directory served at `/` (viewer page), disabled when unset
    pub static_dir: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 4050,
            bind_address: "0.0.0.0".to_string(),
            static_dir: None,
        }
    }
}

/// RTP ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// UDP address the RTP source sends to
    pub bind_address: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6969".to_string(),
        }
    }
}

/// Outbound stream identity, shared by every viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Codec of the ingested elementary stream
    pub codec: VideoCodec,
    /// Track ID announced to viewers
    pub track_id: String,
    /// Stream ID announced to viewers
    pub stream_id: String,
    /// Largest RTP datagram accepted, also sizes the RTCP drain buffer
    pub mtu: usize,
    /// RTP clock rate
    pub clock_rate: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            track_id: "video".to_string(),
            stream_id: "cam1".to_string(),
            mtu: 1600,
            clock_rate: 90000,
        }
    }
}

/// Viewer admission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Maximum concurrent viewers
    pub max_viewers: usize,
    /// Packets buffered per viewer before new packets are dropped
    pub feed_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_viewers: 64,
            feed_capacity: 256,
        }
    }
}
