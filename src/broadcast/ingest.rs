//! UDP RTP ingest
//!
//! Reads RTP datagrams from one UDP socket, drops anything that is not RTP,
//! and publishes the rest to the broadcast unchanged.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rtp::packet::Packet;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{info, warn};
use webrtc::util::Unmarshal;

use super::{BroadcastHandle, IngestState};
use crate::config::IngestConfig;
use crate::error::{AppError, Result};
use crate::events::SystemEvent;
use crate::utils::{bind_udp_socket, LogThrottler};
use crate::warn_throttled;
use crate::webrtc::NegotiationEngine;

const RTP_VERSION: u8 = 2;
const RTP_HEADER_LEN: usize = 12;

/// Check that `datagram` is an RTP packet
pub fn validate_rtp(datagram: &[u8]) -> std::result::Result<(), String> {
    if datagram.len() < RTP_HEADER_LEN {
        return Err(format!("{} bytes is shorter than an RTP header", datagram.len()));
    }
    let version = datagram[0] >> 6;
    if version != RTP_VERSION {
        return Err(format!("RTP version {}", version));
    }
    let mut buf = datagram;
    Packet::unmarshal(&mut buf).map_err(|e| e.to_string())?;
    Ok(())
}

/// UDP listener feeding a [`BroadcastHandle`]
pub struct RtpIngest<E: NegotiationEngine> {
    socket: UdpSocket,
    address: SocketAddr,
    mtu: usize,
    handle: Arc<BroadcastHandle<E>>,
    throttler: LogThrottler,
}

impl<E: NegotiationEngine> RtpIngest<E> {
    /// Bind the ingest socket
    pub fn bind(config: &IngestConfig, mtu: usize, handle: Arc<BroadcastHandle<E>>) -> Result<Self> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            AppError::Config(format!(
                "Invalid ingest address {}: {}",
                config.bind_address, e
            ))
        })?;
        let socket = bind_udp_socket(addr)
            .and_then(UdpSocket::from_std)
            .map_err(|e| AppError::Ingest(format!("Failed to bind {}: {}", addr, e)))?;
        let address = socket.local_addr()?;

        Ok(Self {
            socket,
            address,
            mtu,
            handle,
            throttler: LogThrottler::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    fn set_state(&self, state: IngestState, error: Option<String>) {
        self.handle.set_ingest_state(state);
        self.handle.events().publish(SystemEvent::IngestStateChanged {
            state: state.to_string(),
            address: self.address.to_string(),
            error,
        });
    }

    /// Receive until shutdown or a socket error
    ///
    /// A socket error closes every viewer feed, since no more packets will
    /// arrive.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("RTP ingest listening on udp://{}", self.address);
        self.set_state(IngestState::Listening, None);

        let mut buf = vec![0u8; self.mtu];
        let failure = loop {
            let (len, from) = tokio::select! {
                _ = shutdown.recv() => break None,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => break Some(e.to_string()),
                },
            };

            if len == buf.len() {
                warn_throttled!(
                    self.throttler,
                    "datagram_at_mtu",
                    "Datagram from {} filled the {} byte buffer and may be truncated",
                    from,
                    self.mtu
                );
            }

            let datagram = &buf[..len];
            match validate_rtp(datagram) {
                Ok(()) => self.handle.publish(Bytes::copy_from_slice(datagram)).await,
                Err(e) => {
                    self.handle.record_invalid_packet();
                    if let Some(suppressed) = self.throttler.check("invalid_rtp") {
                        warn!(
                            "Dropping non-RTP datagram from {}: {} ({} similar suppressed)",
                            from, e, suppressed
                        );
                    }
                }
            }
        };

        match failure {
            None => {
                info!("RTP ingest stopped");
                self.set_state(IngestState::Stopped, None);
                Ok(())
            }
            Some(e) => {
                warn!("RTP ingest receive failed: {}", e);
                self.set_state(IngestState::Stopped, Some(e.clone()));
                self.handle.close_feeds().await;
                Err(AppError::Ingest(e))
            }
        }
    }
}
