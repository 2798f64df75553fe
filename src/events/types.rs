//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

/// System event enum
///
/// Serialized as:
/// ```json
/// {
///   "event": "viewer.joined",
///   "data": { "session_id": "...", "viewers": 3 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// A viewer session was admitted and sent its offer
    #[serde(rename = "viewer.joined")]
    ViewerJoined {
        session_id: String,
        /// Viewer count after admission
        viewers: usize,
    },

    /// A viewer session closed and was removed from the broadcast
    #[serde(rename = "viewer.left")]
    ViewerLeft { session_id: String, viewers: usize },

    /// A viewer was turned away before a session was created
    #[serde(rename = "viewer.rejected")]
    ViewerRejected { reason: String, viewers: usize },

    /// RTP ingest state changed
    #[serde(rename = "ingest.state_changed")]
    IngestStateChanged {
        /// "listening" or "stopped"
        state: String,
        /// UDP address packets are read from
        address: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Error event (for client-side error handling)
    #[serde(rename = "error")]
    Error { message: String },
}

impl SystemEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ViewerJoined { .. } => "viewer.joined",
            Self::ViewerLeft { .. } => "viewer.left",
            Self::ViewerRejected { .. } => "viewer.rejected",
            Self::IngestStateChanged { .. } => "ingest.state_changed",
            Self::Error { .. } => "error",
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `viewer.*` matches all viewer events
    /// - `viewer.joined` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        } else {
            event_name == topic
        }
    }
}
