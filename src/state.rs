use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::broadcast::BroadcastHandle;
use crate::config::AppConfig;
use crate::events::EventBus;
use crate::webrtc::RtcEngine;

/// Broadcast fan-out backed by `webrtc-rs`
pub type Broadcast = BroadcastHandle<RtcEngine>;

/// Application-wide state shared across handlers
pub struct AppState {
    /// Effective configuration (file + command line)
    pub config: AppConfig,
    /// Viewer registry and packet fan-out
    pub broadcast: Arc<Broadcast>,
    /// Event bus for real-time notifications
    pub events: Arc<EventBus>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        broadcast: Arc<Broadcast>,
        events: Arc<EventBus>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            broadcast,
            events,
            shutdown_tx,
            started_at: Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Subscribe to the shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
