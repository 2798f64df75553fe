//! `webrtc-rs` implementation of the negotiation engine

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use super::config::WebRtcConfig;
use super::engine::{
    EngineConnection, FeedbackSource, NegotiationEngine, OnIceCandidateFn, OnStateChangeFn,
    OutboundTrack, TrackSpec,
};
use super::mdns::mdns_host_name;
use super::signaling::{ConnectionState, IceCandidate, SdpType, SessionDescription};
use crate::error::{AppError, Result};

/// Negotiation engine backed by `webrtc-rs`
pub struct RtcEngine {
    config: WebRtcConfig,
}

impl RtcEngine {
    pub fn new(config: WebRtcConfig) -> Self {
        info!(
            "WebRTC engine: {} STUN, {} TURN, mDNS {}",
            config.stun_servers.len(),
            config.turn_servers.len(),
            config.mdns_mode.label()
        );
        Self { config }
    }
}

#[async_trait]
impl NegotiationEngine for RtcEngine {
    type Track = TrackLocalStaticRTP;
    type Connection = RtcConnection;

    async fn new_connection(&self, session_id: &str) -> Result<RtcConnection> {
        // Create media engine
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtc(format!("Failed to register codecs: {}", e)))?;

        // Create interceptor registry
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let mut setting_engine = SettingEngine::default();
        let mode = self.config.mdns_mode.to_rtc();
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(mdns_host_name(session_id));
        }

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtc(format!("Failed to create peer connection: {}", e))
        })?;
        let pc = Arc::new(pc);

        let session_id_ice = session_id.to_string();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let session_id = session_id_ice.clone();
            Box::pin(async move {
                debug!("[ICE] Session {} connection state: {:?}", session_id, state);
            })
        }));

        Ok(RtcConnection { pc })
    }

    fn new_outbound_track(&self, spec: &TrackSpec) -> Result<Arc<TrackLocalStaticRTP>> {
        Ok(Arc::new(TrackLocalStaticRTP::new(
            spec.codec.capability(spec.clock_rate),
            spec.track_id.clone(),
            spec.stream_id.clone(),
        )))
    }
}

/// Peer connection handle owned by one session
pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| AppError::WebRtc(format!("Invalid SDP: {}", e)))
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

#[async_trait]
impl EngineConnection for RtcConnection {
    type Track = TrackLocalStaticRTP;
    type Feedback = RtcFeedback;

    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<RtcFeedback> {
        let transceiver = self
            .pc
            .add_transceiver_from_track(
                track as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to add video track: {}", e)))?;

        Ok(RtcFeedback {
            sender: transceiver.sender().await,
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate.into_init())
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to add ICE candidate: {}", e)))
    }

    fn on_ice_candidate(&self, mut handler: OnIceCandidateFn) {
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let candidate = candidate
                    .and_then(|c| c.to_json().ok())
                    .map(IceCandidate::from);
                handler(candidate)
            }));
    }

    fn on_connection_state_change(&self, mut handler: OnStateChangeFn) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                match map_state(s) {
                    Some(state) => handler(state),
                    None => Box::pin(async {}),
                }
            }));
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to close peer connection: {}", e)))
    }
}

#[async_trait]
impl OutboundTrack for TrackLocalStaticRTP {
    async fn write(&self, packet: &[u8]) -> Result<usize> {
        TrackLocalWriter::write(self, packet)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to write RTP packet: {}", e)))
    }
}

/// RTCP reader of a send-only RTP sender
pub struct RtcFeedback {
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl FeedbackSource for RtcFeedback {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let (packets, _) = self
            .sender
            .read(buf)
            .await
            .map_err(|e| AppError::WebRtc(format!("RTCP read failed: {}", e)))?;
        Ok(packets.len())
    }
}
