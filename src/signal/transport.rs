//! Signal channel transports

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SignalEnvelope;
use crate::error::{AppError, Result};

/// Text-frame transport underneath a [`SignalChannel`](super::SignalChannel)
#[async_trait]
pub trait SignalTransport: Send + Sync + 'static {
    /// Send one text frame
    async fn send(&self, text: String) -> Result<()>;

    /// Receive the next text frame, `None` once the transport has ended
    async fn recv(&self) -> Option<Result<String>>;

    /// Terminate the transport; pending and later `recv` calls return `None`
    async fn close(&self);
}

/// In-process transport over tokio channels
///
/// Used to embed a viewer without a socket, and by tests to play the viewer.
pub struct ChannelTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    cancel: CancellationToken,
}

/// The viewer's side of a [`ChannelTransport`]
pub struct RemoteEnd {
    pub tx: mpsc::UnboundedSender<String>,
    pub rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let transport = Self {
            outbound: Mutex::new(Some(out_tx)),
            inbound: tokio::sync::Mutex::new(in_rx),
            cancel: CancellationToken::new(),
        };
        (
            transport,
            RemoteEnd {
                tx: in_tx,
                rx: out_rx,
            },
        )
    }
}

#[async_trait]
impl SignalTransport for ChannelTransport {
    async fn send(&self, text: String) -> Result<()> {
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx
                .send(text)
                .map_err(|_| AppError::Signal("remote end dropped".to_string())),
            None => Err(AppError::Signal("transport closed".to_string())),
        }
    }

    async fn recv(&self) -> Option<Result<String>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = inbound.recv() => msg.map(Ok),
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.outbound.lock().take();
    }
}

impl RemoteEnd {
    /// Send an event as the viewer would
    pub fn send_event<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<()> {
        let text = serde_json::to_string(&SignalEnvelope::new(event, payload)?)?;
        self.tx
            .send(text)
            .map_err(|_| AppError::Signal("transport dropped".to_string()))
    }

    /// Next event sent by the server, `None` once the server closed the transport
    pub async fn recv_event(&mut self) -> Option<SignalEnvelope> {
        let text = self.rx.recv().await?;
        serde_json::from_str(&text).ok()
    }
}
