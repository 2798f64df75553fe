//! Per-session signaling bus
//!
//! A [`SignalChannel`] carries named JSON events between the server and one
//! viewer. Each frame on the wire is an envelope:
//!
//! ```text
//! {"event": "answer", "payload": "v=0\r\n..."}
//! ```
//!
//! Handlers are registered per event name and invoked one at a time by
//! [`SignalChannel::listen`], so a session never sees two of its own
//! signaling events concurrently.

pub mod transport;
pub mod ws;

pub use transport::{ChannelTransport, RemoteEnd, SignalTransport};
pub use ws::WsTransport;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// Wire envelope of one signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl SignalEnvelope {
    pub fn new<T: Serialize + ?Sized>(event: &str, payload: &T) -> Result<Self> {
        Ok(Self {
            event: event.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Named-event message bus over a [`SignalTransport`]
pub struct SignalChannel {
    transport: Box<dyn SignalTransport>,
    handlers: RwLock<HashMap<String, EventHandler>>,
    closed: AtomicBool,
}

impl SignalChannel {
    pub fn new(transport: impl SignalTransport) -> Arc<Self> {
        Arc::new(Self {
            transport: Box::new(transport),
            handlers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Register the handler for `event`, replacing any previous one
    pub fn set_event<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |payload| handler(payload).boxed());
        self.handlers.write().insert(event.to_string(), handler);
    }

    /// Serialize `payload` and send it as `event`
    pub async fn send_message<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::Signal("signal channel closed".to_string()));
        }
        let text = serde_json::to_string(&SignalEnvelope::new(event, payload)?)?;
        self.transport.send(text).await
    }

    /// Dispatch incoming events until the transport ends or the channel is closed
    pub async fn listen(&self) {
        while let Some(frame) = self.transport.recv().await {
            let text = match frame {
                Ok(text) => text,
                Err(e) => {
                    warn!("Signal channel receive error: {}", e);
                    break;
                }
            };

            let envelope: SignalEnvelope = match serde_json::from_str(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Ignoring malformed signal message: {}", e);
                    continue;
                }
            };

            let handler = self.handlers.read().get(&envelope.event).cloned();
            match handler {
                Some(handler) => handler(envelope.payload).await,
                None => debug!("No handler for signal event '{}'", envelope.event),
            }

            if self.is_closed() {
                break;
            }
        }
    }

    /// Close the transport and drop all handlers; repeated calls are no-ops
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.handlers.write().clear();
        self.transport.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
