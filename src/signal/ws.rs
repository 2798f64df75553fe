//! WebSocket signal transport

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::transport::SignalTransport;
use crate::error::{AppError, Result};

/// Signal transport over an upgraded axum WebSocket
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    cancel: CancellationToken,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl SignalTransport for WsTransport {
    async fn send(&self, text: String) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Signal("WebSocket closed".to_string()));
        }
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| AppError::Signal(format!("WebSocket send failed: {}", e)))
    }

    async fn recv(&self) -> Option<Result<String>> {
        let mut stream = self.stream.lock().await;
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                msg = stream.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("Ignoring non UTF-8 binary signal frame"),
                },
                // axum answers pings itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    return Some(Err(AppError::Signal(format!(
                        "WebSocket receive failed: {}",
                        e
                    ))))
                }
            }
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
}
