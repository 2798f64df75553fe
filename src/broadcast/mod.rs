//! Broadcast fan-out
//!
//! One RTP source, many viewers. Every admitted viewer gets a bounded packet
//! feed and a [`PeerSession`]; [`BroadcastHandle::publish`] copies each packet
//! into every feed, and sessions hand their id back on close so the registry
//! entry (and with it the feed sender) is dropped.
//!
//! ```text
//! RtpIngest --publish--> BroadcastHandle --feed--> PeerSession --> viewer
//!                              ^                        |
//!                              +------ deregister ------+
//! ```

pub mod ingest;

pub use ingest::RtpIngest;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

use crate::config::{BroadcastConfig, StreamConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::signal::{SignalChannel, SignalTransport};
use crate::webrtc::signaling::{reason, SignalEvent};
use crate::webrtc::{NegotiationEngine, PeerSession, SessionParams};

/// RTP ingest state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestState {
    /// No ingest attached yet
    #[default]
    Idle,
    Listening,
    Stopped,
}

impl std::fmt::Display for IngestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestState::Idle => write!(f, "idle"),
            IngestState::Listening => write!(f, "listening"),
            IngestState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Broadcast statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastStats {
    /// Packets handed to `publish`
    pub packets_received: u64,
    /// Packet copies queued into viewer feeds
    pub packets_forwarded: u64,
    /// Packet copies dropped because a feed was full
    pub packets_dropped: u64,
    /// Datagrams rejected by ingest validation
    pub invalid_packets: u64,
    pub viewers_admitted: u64,
    /// Viewers turned away (limit reached or shutting down)
    pub viewers_rejected: u64,
    /// Currently registered viewers
    pub viewers: usize,
    pub ingest_state: IngestState,
}

#[derive(Default)]
struct Counters {
    packets_received: AtomicU64,
    packets_forwarded: AtomicU64,
    packets_dropped: AtomicU64,
    invalid_packets: AtomicU64,
    viewers_admitted: AtomicU64,
    viewers_rejected: AtomicU64,
}

struct ViewerEntry<E: NegotiationEngine> {
    /// `None` once upstream has ended
    feed: Option<mpsc::Sender<Bytes>>,
    /// `None` while the session is still starting
    session: Option<PeerSession<E>>,
}

type Registry<E> = Arc<RwLock<HashMap<String, ViewerEntry<E>>>>;

/// Viewer registry and packet fan-out
pub struct BroadcastHandle<E: NegotiationEngine> {
    params: Arc<SessionParams<E>>,
    config: BroadcastConfig,
    viewers: Registry<E>,
    deregister_tx: mpsc::UnboundedSender<String>,
    events: Arc<EventBus>,
    counters: Counters,
    ingest_state: parking_lot::Mutex<IngestState>,
    shutting_down: AtomicBool,
}

impl<E: NegotiationEngine> BroadcastHandle<E> {
    /// Create the fan-out and start its deregistration task
    pub fn new(
        broadcast: BroadcastConfig,
        stream: &StreamConfig,
        engine: E,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let viewers: Registry<E> = Arc::new(RwLock::new(HashMap::new()));
        let (deregister_tx, deregister_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run_deregistration(
            deregister_rx,
            viewers.clone(),
            events.clone(),
        ));

        info!(
            "Broadcast ready: track={} stream={} codec={} max_viewers={}",
            stream.track_id, stream.stream_id, stream.codec, broadcast.max_viewers
        );

        Arc::new(Self {
            params: Arc::new(SessionParams::new(engine, stream)),
            config: broadcast,
            viewers,
            deregister_tx,
            events,
            counters: Counters::default(),
            ingest_state: parking_lot::Mutex::new(IngestState::Idle),
            shutting_down: AtomicBool::new(false),
        })
    }

    async fn run_deregistration(
        mut rx: mpsc::UnboundedReceiver<String>,
        viewers: Registry<E>,
        events: Arc<EventBus>,
    ) {
        while let Some(session_id) = rx.recv().await {
            let (removed, remaining) = {
                let mut viewers = viewers.write().await;
                let removed = viewers.remove(&session_id).is_some();
                (removed, viewers.len())
            };
            if removed {
                info!("Viewer {} left ({} remaining)", session_id, remaining);
                events.publish(SystemEvent::ViewerLeft {
                    session_id,
                    viewers: remaining,
                });
            }
        }
        debug!("Broadcast deregistration task stopped");
    }

    /// Admit a viewer on `transport` and send it the offer
    ///
    /// Returns the session id. A full or shutting-down broadcast answers
    /// with `reject` and `close` and returns an error.
    pub async fn add_viewer(&self, transport: impl SignalTransport) -> Result<String> {
        let signal = SignalChannel::new(transport);
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(self.turn_away(&signal, reason::SHUTTING_DOWN).await);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let (feed_tx, feed_rx) = mpsc::channel(self.config.feed_capacity);
        {
            let mut viewers = self.viewers.write().await;
            if viewers.len() >= self.config.max_viewers {
                drop(viewers);
                return Err(self.turn_away(&signal, reason::SERVER_FULL).await);
            }
            viewers.insert(
                session_id.clone(),
                ViewerEntry {
                    feed: Some(feed_tx),
                    session: None,
                },
            );
        }

        let session = match PeerSession::start(
            session_id.clone(),
            self.params.clone(),
            signal,
            feed_rx,
            self.deregister_tx.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!("Viewer {} failed to start: {}", session_id, e);
                return Err(e);
            }
        };

        let count = {
            let mut viewers = self.viewers.write().await;
            match viewers.get_mut(&session_id) {
                Some(entry) if !session.is_closed() => {
                    entry.session = Some(session.clone());
                    Some(viewers.len())
                }
                _ => None,
            }
        };

        // Raced with shutdown: nobody else will close it
        if self.shutting_down.load(Ordering::Acquire) {
            session.close(reason::SHUTTING_DOWN).await;
        }

        if let Some(viewers) = count {
            self.counters.viewers_admitted.fetch_add(1, Ordering::Relaxed);
            info!("Viewer {} joined ({} total)", session_id, viewers);
            self.events.publish(SystemEvent::ViewerJoined {
                session_id: session_id.clone(),
                viewers,
            });
        }
        Ok(session_id)
    }

    async fn turn_away(&self, signal: &SignalChannel, why: &'static str) -> AppError {
        self.counters.viewers_rejected.fetch_add(1, Ordering::Relaxed);
        info!("Turning viewer away: {}", why);

        for event in [SignalEvent::Reject, SignalEvent::Close] {
            if let Err(e) = signal.send_message(event.as_str(), why).await {
                debug!("Could not notify turned away viewer: {}", e);
                break;
            }
        }
        signal.close().await;

        self.events.publish(SystemEvent::ViewerRejected {
            reason: why.to_string(),
            viewers: self.viewer_count().await,
        });
        AppError::ServiceUnavailable(why.to_string())
    }

    /// Queue one packet for every viewer; full feeds drop it
    pub async fn publish(&self, packet: Bytes) {
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);

        let viewers = self.viewers.read().await;
        for (session_id, entry) in viewers.iter() {
            let Some(feed) = entry.feed.as_ref() else {
                continue;
            };
            match feed.try_send(packet.clone()) {
                Ok(()) => {
                    self.counters.packets_forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("Feed of viewer {} full, packet dropped", session_id);
                }
                // session is closing; the deregistration task removes it
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Upstream ended: drop every feed so forwarding loops terminate
    pub async fn close_feeds(&self) {
        let mut viewers = self.viewers.write().await;
        let mut closed = 0;
        for entry in viewers.values_mut() {
            if entry.feed.take().is_some() {
                closed += 1;
            }
        }
        info!("Closed {} viewer feeds", closed);
    }

    /// Close every session and refuse new viewers
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);

        let sessions: Vec<PeerSession<E>> = self
            .viewers
            .read()
            .await
            .values()
            .filter_map(|entry| entry.session.clone())
            .collect();

        info!("Shutting down broadcast, closing {} sessions", sessions.len());
        futures::future::join_all(
            sessions
                .iter()
                .map(|session| session.close(reason::SHUTTING_DOWN)),
        )
        .await;
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let c = &self.counters;
        BroadcastStats {
            packets_received: c.packets_received.load(Ordering::Relaxed),
            packets_forwarded: c.packets_forwarded.load(Ordering::Relaxed),
            packets_dropped: c.packets_dropped.load(Ordering::Relaxed),
            invalid_packets: c.invalid_packets.load(Ordering::Relaxed),
            viewers_admitted: c.viewers_admitted.load(Ordering::Relaxed),
            viewers_rejected: c.viewers_rejected.load(Ordering::Relaxed),
            viewers: self.viewer_count().await,
            ingest_state: self.ingest_state(),
        }
    }

    pub fn ingest_state(&self) -> IngestState {
        *self.ingest_state.lock()
    }

    pub(crate) fn set_ingest_state(&self, state: IngestState) {
        *self.ingest_state.lock() = state;
    }

    pub(crate) fn record_invalid_packet(&self) {
        self.counters.invalid_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn stream(&self) -> &crate::webrtc::TrackSpec {
        &self.params.track
    }
}
