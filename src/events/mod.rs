//! Broadcast lifecycle events
//!
//! Viewer admissions and departures, turned-away viewers and ingest state
//! changes are published here and relayed to `/api/ws` clients.

pub mod types;

pub use types::SystemEvent;

use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out of [`SystemEvent`]s to any number of listeners
///
/// ```no_run
/// use rtp_broadcast::events::{EventBus, SystemEvent};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
/// bus.publish(SystemEvent::ViewerJoined {
///     session_id: "viewer-1".to_string(),
///     viewers: 1,
/// });
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         tracing::debug!("{}", event.event_name());
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Send to current listeners; dropped when there are none
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    /// Listener for events published from now on
    ///
    /// A listener more than 256 events behind gets `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
