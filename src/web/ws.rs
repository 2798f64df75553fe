//! WebSocket handler for real-time event streaming
//!
//! `/api/ws` pushes [`SystemEvent`]s to clients that subscribe to topics
//! such as `viewer.*`, `ingest.state_changed` or `*`.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::SystemEvent;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Client-to-server message
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
enum ClientMessage {
    /// Subscribe to event topics
    #[serde(rename = "subscribe")]
    Subscribe { topics: Vec<String> },

    /// Unsubscribe from event topics
    #[serde(rename = "unsubscribe")]
    Unsubscribe { topics: Vec<String> },

    /// Ping (keep-alive)
    #[serde(rename = "ping")]
    Ping,
}

/// Event WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let mut event_rx = state.events.subscribe();
    let mut shutdown_rx = state.shutdown_signal();

    // Nothing is sent until the client subscribes
    let mut subscribed_topics: Vec<String> = vec![];

    info!(
        "Event WebSocket client connected ({} listeners)",
        state.events.subscriber_count()
    );

    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_message(&text, &mut subscribed_topics) {
                            warn!("Ignoring event WebSocket message: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Event WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Event WebSocket receive error: {}", e);
                        break;
                    }
                    // axum answers pings; binary frames carry nothing here
                    Some(Ok(_)) => {}
                }
            }

            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        if !should_send_event(&event, &subscribed_topics) {
                            continue;
                        }
                        if let Ok(json) = serde_json::to_string(&event) {
                            if sender.send(Message::Text(json)).await.is_err() {
                                warn!("Failed to send event to client, disconnecting");
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event WebSocket client lagged by {} events", n);
                        let error_event = SystemEvent::Error {
                            message: format!("Lagged by {} events", n),
                        };
                        if let Ok(json) = serde_json::to_string(&error_event) {
                            let _ = sender.send(Message::Text(json)).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Event bus closed");
                        break;
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Failed to send ping, disconnecting");
                    break;
                }
            }
        }
    }

    debug!("Event WebSocket handler exiting");
}

/// Apply a subscription message from the client
fn handle_client_message(text: &str, topics: &mut Vec<String>) -> serde_json::Result<()> {
    match serde_json::from_str(text)? {
        ClientMessage::Subscribe { topics: new_topics } => {
            info!("Client subscribed to topics: {:?}", new_topics);
            *topics = new_topics;
        }
        ClientMessage::Unsubscribe {
            topics: remove_topics,
        } => {
            topics.retain(|t| !remove_topics.contains(t));
            info!("Client unsubscribed from topics: {:?}", remove_topics);
        }
        ClientMessage::Ping => {
            debug!("Received ping from client");
        }
    }

    Ok(())
}

/// Check if an event should be sent based on subscribed topics
fn should_send_event(event: &SystemEvent, topics: &[String]) -> bool {
    topics.iter().any(|topic| event.matches_topic(topic))
}
