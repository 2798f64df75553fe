//! Per-viewer peer session
//!
//! A [`PeerSession`] owns one negotiation-engine connection and one signal
//! channel. It sends the offer, relays ICE candidates both ways, and once the
//! connection is established pumps packets from its broadcast feed into its
//! outbound track until closed.
//!
//! ```text
//! Created -> OfferSent -> Negotiating -> Connected
//!    |           |             |             |
//!    +-----------+------+------+-------------+
//!                       v
//!                    Closed
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::engine::{EngineConnection, FeedbackSource, NegotiationEngine, OutboundTrack, TrackSpec};
use super::signaling::{reason, ConnectionState, IceCandidate, SessionDescription, SignalEvent};
use crate::config::StreamConfig;
use crate::error::{AppError, Result};
use crate::signal::SignalChannel;

/// Configuration shared read-only by every session of a broadcast
pub struct SessionParams<E: NegotiationEngine> {
    pub engine: E,
    pub track: TrackSpec,
    /// Size of the feedback drain buffer
    pub mtu: usize,
}

impl<E: NegotiationEngine> SessionParams<E> {
    pub fn new(engine: E, stream: &StreamConfig) -> Self {
        Self {
            engine,
            track: TrackSpec {
                codec: stream.codec,
                clock_rate: stream.clock_rate,
                track_id: stream.track_id.clone(),
                stream_id: stream.stream_id.clone(),
            },
            mtu: stream.mtu,
        }
    }
}

/// Handshake progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    OfferSent,
    Negotiating,
    Connected,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::OfferSent => write!(f, "offer_sent"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

struct SessionInner<E: NegotiationEngine> {
    id: String,
    params: Arc<SessionParams<E>>,
    signal: Arc<SignalChannel>,
    /// Taken by `close`
    connection: Mutex<Option<Arc<E::Connection>>>,
    state: Mutex<SessionState>,
    running: AtomicBool,
    /// `Some` once the track is attached to the connection
    track_tx: watch::Sender<Option<Arc<E::Track>>>,
    /// Taken by the forwarding loop
    feed: Mutex<Option<mpsc::Receiver<Bytes>>>,
    deregister: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

/// One viewer of the broadcast
pub struct PeerSession<E: NegotiationEngine> {
    inner: Arc<SessionInner<E>>,
}

impl<E: NegotiationEngine> Clone for PeerSession<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Clears the running flag when the forwarding loop exits
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<E: NegotiationEngine> PeerSession<E> {
    /// Create the session and send the offer
    ///
    /// On failure the session has already been closed (peer notified, id
    /// pushed to `deregister`) and the error names the failed step.
    pub async fn start(
        id: String,
        params: Arc<SessionParams<E>>,
        signal: Arc<SignalChannel>,
        feed: mpsc::Receiver<Bytes>,
        deregister: mpsc::UnboundedSender<String>,
    ) -> Result<Self> {
        let connection = match params.engine.new_connection(&id).await {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                let session = Self::new(id, params, signal, None, feed, deregister);
                return Err(session.fail(reason::CREATE_CONNECTION, e).await);
            }
        };
        let session = Self::new(
            id,
            params,
            signal,
            Some(connection.clone()),
            feed,
            deregister,
        );

        session.register_signal_handlers();
        session.register_engine_handlers(&connection);

        if let Err((step, e)) = session.negotiate(&connection).await {
            return Err(session.fail(step, e).await);
        }
        session.advance(SessionState::OfferSent);
        info!("Session {} offer sent", session.id());

        session.spawn_listener();
        Ok(session)
    }

    fn new(
        id: String,
        params: Arc<SessionParams<E>>,
        signal: Arc<SignalChannel>,
        connection: Option<Arc<E::Connection>>,
        feed: mpsc::Receiver<Bytes>,
        deregister: mpsc::UnboundedSender<String>,
    ) -> Self {
        let (track_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(SessionInner {
                id,
                params,
                signal,
                connection: Mutex::new(connection),
                state: Mutex::new(SessionState::Created),
                running: AtomicBool::new(false),
                track_tx,
                feed: Mutex::new(Some(feed)),
                deregister,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Whether the forwarding loop is active
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Tear the session down; only the first call has any effect
    ///
    /// The peer is told first, then the signal channel is closed, background
    /// tasks are cancelled, the connection is released and the id is handed
    /// back to the broadcast.
    pub async fn close(&self, reason: &str) {
        {
            let mut state = self.inner.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        info!("Closing session {}: {}", self.id(), reason);

        if let Err(e) = self
            .inner
            .signal
            .send_message(SignalEvent::Close.as_str(), reason)
            .await
        {
            debug!("Session {} could not notify peer of close: {}", self.id(), e);
        }
        self.inner.signal.close().await;
        self.inner.cancel.cancel();

        let connection = self.inner.connection.lock().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!("Session {} connection close failed: {}", self.id(), e);
            }
        }

        if self.inner.deregister.send(self.inner.id.clone()).is_err() {
            debug!("Session {} closed after broadcast shut down", self.id());
        }
    }

    async fn fail(&self, step: &'static str, err: AppError) -> AppError {
        warn!("Session {} {}: {}", self.id(), step, err);
        self.close(step).await;
        AppError::WebRtc(format!("{}: {}", step, err))
    }

    /// Engine callbacks must not tear the connection down from inside the
    /// engine's own callback
    fn close_in_background(&self, reason: &'static str) {
        let session = self.clone();
        tokio::spawn(async move { session.close(reason).await });
    }

    fn advance(&self, to: SessionState) {
        let mut state = self.inner.state.lock();
        if *state < to && *state != SessionState::Closed {
            trace!("Session {} {} -> {}", self.inner.id, *state, to);
            *state = to;
        }
    }

    fn connection(&self) -> Option<Arc<E::Connection>> {
        self.inner.connection.lock().clone()
    }

    /// Attach the outbound track, then create, apply and send the offer
    async fn negotiate(
        &self,
        connection: &E::Connection,
    ) -> std::result::Result<(), (&'static str, AppError)> {
        let params = &self.inner.params;
        let track = params
            .engine
            .new_outbound_track(&params.track)
            .map_err(|e| (reason::CREATE_TRACK, e))?;
        let feedback = connection
            .add_track(track.clone())
            .await
            .map_err(|e| (reason::ADD_TRACK, e))?;
        self.inner.track_tx.send_replace(Some(track));
        self.spawn_feedback_drain(feedback);

        let offer = connection
            .create_offer()
            .await
            .map_err(|e| (reason::CREATE_OFFER, e))?;
        let sdp = offer.sdp.clone();
        connection
            .set_local_description(offer)
            .await
            .map_err(|e| (reason::ADD_OFFER, e))?;
        self.inner
            .signal
            .send_message(SignalEvent::Offer.as_str(), &sdp)
            .await
            .map_err(|e| (reason::SEND_OFFER, e))?;
        Ok(())
    }

    /// Discard sender feedback so the engine's RTCP interceptors keep running
    fn spawn_feedback_drain(&self, feedback: <E::Connection as EngineConnection>::Feedback) {
        let cancel = self.inner.cancel.clone();
        let mtu = self.inner.params.mtu;
        let id = self.inner.id.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; mtu];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = feedback.read(&mut buf) => {
                        if let Err(e) = result {
                            trace!("Session {} feedback drain stopped: {}", id, e);
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_listener(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            session.inner.signal.listen().await;
            session.close(reason::SIGNALING_CLOSED).await;
        });
    }

    fn register_signal_handlers(&self) {
        for event in SignalEvent::ALL {
            let weak = Arc::downgrade(&self.inner);
            self.inner.signal.set_event(event.as_str(), move |payload| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        PeerSession { inner }.on_signal(event, payload).await;
                    }
                }
            });
        }
    }

    fn register_engine_handlers(&self, connection: &E::Connection) {
        let weak = Arc::downgrade(&self.inner);
        connection.on_ice_candidate(Box::new(move |candidate| {
            let weak = weak.clone();
            Box::pin(async move {
                // end of gathering is not forwarded
                let (Some(candidate), Some(inner)) = (candidate, weak.upgrade()) else {
                    return;
                };
                PeerSession { inner }.on_local_candidate(candidate).await;
            })
        }));

        let weak = Arc::downgrade(&self.inner);
        connection.on_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    PeerSession { inner }.on_connection_state(state);
                }
            })
        }));
    }

    async fn on_signal(&self, event: SignalEvent, payload: Value) {
        if self.is_closed() {
            return;
        }
        match event {
            SignalEvent::Offer => {
                warn!("Session {} received an offer from the viewer", self.id());
                self.reject(reason::UNEXPECTED_OFFER).await;
                self.close(reason::MISBEHAVING_HOST).await;
            }
            SignalEvent::Answer => self.on_answer(payload).await,
            SignalEvent::Candidate => self.on_remote_candidate(payload).await,
            SignalEvent::Reject => {
                info!("Session {} rejected by viewer: {}", self.id(), payload);
                self.close(reason::REJECTED).await;
            }
            SignalEvent::Close => {
                debug!("Session {} closed by viewer: {}", self.id(), payload);
                self.close(reason::OK).await;
            }
        }
    }

    async fn reject(&self, reason: &str) {
        if let Err(e) = self
            .inner
            .signal
            .send_message(SignalEvent::Reject.as_str(), reason)
            .await
        {
            debug!("Session {} could not send reject: {}", self.id(), e);
        }
    }

    async fn on_answer(&self, payload: Value) {
        let answer = serde_json::from_value::<String>(payload)
            .map_err(|e| e.to_string())
            .and_then(SessionDescription::answer);
        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Session {} invalid answer: {}", self.id(), e);
                self.reject(reason::INVALID_ANSWER).await;
                self.close(reason::PARSE_ANSWER).await;
                return;
            }
        };

        let Some(connection) = self.connection() else {
            return;
        };
        if let Err(e) = connection.set_remote_description(answer).await {
            warn!("Session {} failed to apply answer: {}", self.id(), e);
            self.close(reason::ADD_ANSWER).await;
            return;
        }
        self.advance(SessionState::Negotiating);
        debug!("Session {} answer applied", self.id());
    }

    async fn on_remote_candidate(&self, payload: Value) {
        let candidate = match serde_json::from_value::<Option<IceCandidate>>(payload) {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                debug!("Session {} viewer finished gathering candidates", self.id());
                return;
            }
            Err(e) => {
                warn!("Session {} invalid candidate: {}", self.id(), e);
                self.reject(reason::INVALID_CANDIDATE).await;
                self.close(reason::PARSE_CANDIDATE).await;
                return;
            }
        };

        let Some(connection) = self.connection() else {
            return;
        };
        trace!("Session {} remote candidate: {}", self.id(), candidate.candidate);
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            warn!("Session {} failed to add candidate: {}", self.id(), e);
            self.close(reason::ADD_CANDIDATE).await;
        }
    }

    async fn on_local_candidate(&self, candidate: IceCandidate) {
        if self.is_closed() {
            return;
        }
        trace!("Session {} local candidate: {}", self.id(), candidate.candidate);
        if let Err(e) = self
            .inner
            .signal
            .send_message(SignalEvent::Candidate.as_str(), &candidate)
            .await
        {
            warn!("Session {} failed to send candidate: {}", self.id(), e);
            self.close_in_background(reason::SEND_CANDIDATE);
        }
    }

    fn on_connection_state(&self, state: ConnectionState) {
        info!("Session {} connection state: {}", self.id(), state);
        match state {
            ConnectionState::Connected => {
                self.advance(SessionState::Connected);
                self.start_forwarding();
            }
            ConnectionState::Failed => self.close_in_background(reason::CONNECTION_FAILED),
            ConnectionState::Closed => self.close_in_background(reason::CONNECTION_CLOSED),
            // ICE may still recover from disconnected
            ConnectionState::New | ConnectionState::Connecting | ConnectionState::Disconnected => {}
        }
    }

    fn start_forwarding(&self) {
        if self.is_closed() {
            return;
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Session {} forwarding already running", self.id());
            return;
        }
        let session = self.clone();
        tokio::spawn(async move { session.forward().await });
    }

    async fn wait_for_track(&self) -> Option<Arc<E::Track>> {
        let mut rx = self.inner.track_tx.subscribe();
        let ready = rx.wait_for(Option::is_some).await.ok()?;
        ready.clone()
    }

    async fn forward(&self) {
        let _running = RunningGuard(&self.inner.running);
        let cancel = self.inner.cancel.clone();

        let track = tokio::select! {
            _ = cancel.cancelled() => return,
            track = self.wait_for_track() => track,
        };
        let Some(track) = track else {
            return;
        };
        let Some(mut feed) = self.inner.feed.lock().take() else {
            return;
        };
        debug!("Session {} forwarding started", self.id());

        let mut forwarded: u64 = 0;
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break,
                packet = feed.recv() => packet,
            };
            let Some(packet) = packet else {
                self.close(reason::READ_STREAM).await;
                break;
            };
            if let Err(e) = track.write(&packet).await {
                warn!("Session {} track write failed: {}", self.id(), e);
                self.close(reason::WRITE_TRACK).await;
                break;
            }
            forwarded += 1;
        }
        debug!(
            "Session {} forwarding stopped after {} packets",
            self.id(),
            forwarded
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{ChannelTransport, RemoteEnd, SignalEnvelope};
    use crate::webrtc::fake::{eventually, FakeEngine, FakeScript, FAKE_ANSWER_SDP, FAKE_OFFER_SDP};
    use std::time::Duration;

    struct Harness {
        session: Result<PeerSession<FakeEngine>>,
        engine: FakeEngine,
        remote: RemoteEnd,
        feed_tx: mpsc::Sender<Bytes>,
        deregister_rx: mpsc::UnboundedReceiver<String>,
    }

    async fn start(script: FakeScript) -> Harness {
        let engine = FakeEngine::with_script(script);
        let params = Arc::new(SessionParams::new(engine.clone(), &StreamConfig::default()));
        let (transport, remote) = ChannelTransport::pair();
        let (feed_tx, feed_rx) = mpsc::channel(16);
        let (deregister_tx, deregister_rx) = mpsc::unbounded_channel();
        let session = PeerSession::start(
            "viewer-1".to_string(),
            params,
            SignalChannel::new(transport),
            feed_rx,
            deregister_tx,
        )
        .await;
        Harness {
            session,
            engine,
            remote,
            feed_tx,
            deregister_rx,
        }
    }

    async fn next_event(remote: &mut RemoteEnd) -> SignalEnvelope {
        tokio::time::timeout(Duration::from_secs(1), remote.recv_event())
            .await
            .expect("timed out waiting for signal event")
            .expect("signal transport closed")
    }

    async fn assert_transport_closed(remote: &mut RemoteEnd) {
        let next = tokio::time::timeout(Duration::from_secs(1), remote.recv_event())
            .await
            .expect("timed out waiting for transport close");
        assert_eq!(next, None);
    }

    /// Start a session and run it to the connected state
    async fn connected() -> Harness {
        let mut h = start(FakeScript::default()).await;
        let offer = next_event(&mut h.remote).await;
        assert_eq!(offer.event, "offer");

        h.remote.send_event("answer", FAKE_ANSWER_SDP).unwrap();
        let peer = h.engine.peer(0);
        eventually(|| peer.remote_descriptions().len() == 1).await;
        peer.emit_state(ConnectionState::Connected).await;
        h
    }

    #[tokio::test]
    async fn test_handshake_and_forwarding() {
        let mut h = start(FakeScript::default()).await;
        let session = h.session.as_ref().unwrap().clone();
        assert_eq!(session.state(), SessionState::OfferSent);

        let offer = next_event(&mut h.remote).await;
        assert_eq!(offer.event, "offer");
        assert_eq!(offer.payload, FAKE_OFFER_SDP);

        let peer = h.engine.peer(0);
        assert_eq!(peer.local_descriptions().len(), 1);
        assert_eq!(peer.tracks_added(), 1);

        h.remote.send_event("answer", FAKE_ANSWER_SDP).unwrap();
        let c1 = IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 5000 typ host").with_mid("0", 0);
        let c2 = IceCandidate::new("candidate:2 1 udp 1 10.0.0.2 5002 typ host").with_mid("0", 0);
        h.remote.send_event("candidate", &c1).unwrap();
        h.remote.send_event("candidate", &c2).unwrap();

        eventually(|| peer.candidates().len() == 2).await;
        assert_eq!(peer.remote_descriptions()[0].sdp, FAKE_ANSWER_SDP);
        assert_eq!(peer.candidates(), vec![c1, c2]);
        assert_eq!(session.state(), SessionState::Negotiating);

        peer.emit_state(ConnectionState::Connected).await;
        assert_eq!(session.state(), SessionState::Connected);

        for i in 0..3u8 {
            h.feed_tx.send(Bytes::from(vec![0x80, 96, 0, i])).await.unwrap();
        }
        let track = h.engine.track(0);
        eventually(|| track.writes().len() == 3).await;
        let seqs: Vec<u8> = track.writes().iter().map(|p| p[3]).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(session.is_running());

        // only the offer was sent
        assert!(h.remote.rx.try_recv().is_err());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_local_candidates_are_relayed() {
        let mut h = connected().await;
        let peer = h.engine.peer(0);

        let local = IceCandidate::new("candidate:9 1 udp 1 192.168.1.2 6000 typ host");
        peer.emit_candidate(Some(local.clone())).await;
        peer.emit_candidate(None).await;

        let event = next_event(&mut h.remote).await;
        assert_eq!(event.event, "candidate");
        let relayed: IceCandidate = serde_json::from_value(event.payload).unwrap();
        assert_eq!(relayed, local);
        assert!(h.remote.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_from_viewer_before_answer() {
        let mut h = start(FakeScript::default()).await;
        let session = h.session.as_ref().unwrap().clone();
        assert_eq!(next_event(&mut h.remote).await.event, "offer");

        h.remote.send_event("close", "bye").unwrap();
        h.remote.send_event("answer", FAKE_ANSWER_SDP).unwrap();

        let close = next_event(&mut h.remote).await;
        assert_eq!(close.event, "close");
        assert_eq!(close.payload, "ok");
        assert_transport_closed(&mut h.remote).await;

        assert_eq!(h.deregister_rx.recv().await.as_deref(), Some("viewer-1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.deregister_rx.try_recv().is_err());

        let peer = h.engine.peer(0);
        assert!(peer.remote_descriptions().is_empty());
        assert_eq!(peer.close_count(), 1);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_offer_from_viewer_is_rejected() {
        let mut h = connected().await;
        let session = h.session.as_ref().unwrap().clone();

        h.remote.send_event("offer", FAKE_OFFER_SDP).unwrap();

        let reject = next_event(&mut h.remote).await;
        assert_eq!(reject.event, "reject");
        assert_eq!(reject.payload, "unexpected offer");
        let close = next_event(&mut h.remote).await;
        assert_eq!(close.event, "close");
        assert_eq!(close.payload, "misbehaving host");

        assert_eq!(h.deregister_rx.recv().await.as_deref(), Some("viewer-1"));
        assert!(session.is_closed());
        eventually(|| !session.is_running()).await;
    }

    #[tokio::test]
    async fn test_malformed_answer_leaves_remote_description_untouched() {
        for payload in [serde_json::json!(42), serde_json::json!("not sdp")] {
            let mut h = start(FakeScript::default()).await;
            next_event(&mut h.remote).await;

            h.remote.send_event("answer", &payload).unwrap();

            let reject = next_event(&mut h.remote).await;
            assert_eq!(reject.event, "reject");
            assert_eq!(reject.payload, "invalid answer");
            let close = next_event(&mut h.remote).await;
            assert_eq!(close.payload, "failed to parse answer");

            assert!(h.engine.peer(0).remote_descriptions().is_empty());
            assert_eq!(h.deregister_rx.recv().await.as_deref(), Some("viewer-1"));
        }
    }

    #[tokio::test]
    async fn test_answer_apply_failure() {
        let mut h = start(FakeScript {
            fail_remote_description: true,
            ..Default::default()
        })
        .await;
        next_event(&mut h.remote).await;

        h.remote.send_event("answer", FAKE_ANSWER_SDP).unwrap();

        let close = next_event(&mut h.remote).await;
        assert_eq!(close.event, "close");
        assert_eq!(close.payload, "failed to add answer");
    }

    #[tokio::test]
    async fn test_malformed_candidate() {
        let mut h = start(FakeScript::default()).await;
        next_event(&mut h.remote).await;
        h.remote.send_event("answer", FAKE_ANSWER_SDP).unwrap();

        h.remote
            .send_event("candidate", &serde_json::json!({"sdpMid": "0"}))
            .unwrap();

        let reject = next_event(&mut h.remote).await;
        assert_eq!(reject.payload, "invalid candidate");
        let close = next_event(&mut h.remote).await;
        assert_eq!(close.payload, "failed to parse candidate");
        assert!(h.engine.peer(0).candidates().is_empty());
    }

    #[tokio::test]
    async fn test_null_candidate_ends_trickle() {
        let mut h = start(FakeScript::default()).await;
        let session = h.session.as_ref().unwrap().clone();
        next_event(&mut h.remote).await;
        h.remote.send_event("answer", FAKE_ANSWER_SDP).unwrap();

        let c1 = IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 5000 typ host");
        h.remote.send_event("candidate", &c1).unwrap();
        h.remote.send_event("candidate", &Value::Null).unwrap();
        // handlers run in order, so this one is applied after the null
        let c2 = IceCandidate::new("candidate:2 1 udp 1 10.0.0.2 5002 typ host");
        h.remote.send_event("candidate", &c2).unwrap();

        let peer = h.engine.peer(0);
        eventually(|| peer.candidates().len() == 2).await;
        assert_eq!(peer.candidates(), vec![c1, c2]);
        assert!(!session.is_closed());
        assert!(h.remote.rx.try_recv().is_err());
        assert!(h.deregister_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_candidate_apply_failure() {
        let mut h = start(FakeScript {
            fail_candidate: true,
            ..Default::default()
        })
        .await;
        next_event(&mut h.remote).await;

        h.remote
            .send_event("candidate", &IceCandidate::new("candidate:1"))
            .unwrap();

        let close = next_event(&mut h.remote).await;
        assert_eq!(close.event, "close");
        assert_eq!(close.payload, "failed to add candidate");
    }

    #[tokio::test]
    async fn test_reject_from_viewer_closes() {
        let mut h = start(FakeScript::default()).await;
        next_event(&mut h.remote).await;

        h.remote.send_event("reject", "no codec").unwrap();

        let close = next_event(&mut h.remote).await;
        assert_eq!(close.payload, "rejected by peer");
        assert_eq!(h.deregister_rx.recv().await.as_deref(), Some("viewer-1"));
    }

    #[tokio::test]
    async fn test_feed_closed_ends_session() {
        let mut h = connected().await;
        let session = h.session.as_ref().unwrap().clone();

        drop(h.feed_tx);

        let close = next_event(&mut h.remote).await;
        assert_eq!(close.payload, "failed to read stream");
        assert_eq!(h.deregister_rx.recv().await.as_deref(), Some("viewer-1"));
        eventually(|| !session.is_running()).await;
    }

    #[tokio::test]
    async fn test_write_failure_ends_session() {
        let mut h = start(FakeScript {
            fail_write: true,
            ..Default::default()
        })
        .await;
        next_event(&mut h.remote).await;
        h.remote.send_event("answer", FAKE_ANSWER_SDP).unwrap();
        let peer = h.engine.peer(0);
        eventually(|| peer.remote_descriptions().len() == 1).await;
        peer.emit_state(ConnectionState::Connected).await;

        h.feed_tx.send(Bytes::from_static(&[0x80, 96, 0, 1])).await.unwrap();

        let close = next_event(&mut h.remote).await;
        assert_eq!(close.payload, "failed to write track");
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_no_write_when_track_never_attached() {
        let mut h = start(FakeScript {
            fail_add_track: true,
            ..Default::default()
        })
        .await;
        let err = h.session.as_ref().err().unwrap().to_string();
        assert!(err.contains("failed to add track"));

        let close = next_event(&mut h.remote).await;
        assert_eq!(close.event, "close");
        assert_eq!(close.payload, "failed to add track");

        // a late connected report must not start forwarding
        let peer = h.engine.peer(0);
        peer.emit_state(ConnectionState::Connected).await;
        let _ = h.feed_tx.send(Bytes::from_static(&[0x80, 96, 0, 1])).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(h.engine.track(0).writes().is_empty());
        assert_eq!(h.deregister_rx.recv().await.as_deref(), Some("viewer-1"));
        assert!(h.deregister_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connected_before_track_is_ready() {
        let mut h = start(FakeScript {
            connect_during_add_track: true,
            ..Default::default()
        })
        .await;
        let session = h.session.as_ref().unwrap().clone();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.is_running());
        assert_eq!(next_event(&mut h.remote).await.event, "offer");

        h.feed_tx.send(Bytes::from_static(&[0x80, 96, 0, 7])).await.unwrap();
        let track = h.engine.track(0);
        eventually(|| track.writes().len() == 1).await;
        assert_eq!(track.writes()[0][3], 7);
    }

    /// A session that has a connection but no track yet
    async fn without_track() -> (
        PeerSession<FakeEngine>,
        FakeEngine,
        mpsc::Sender<Bytes>,
        RemoteEnd,
    ) {
        let engine = FakeEngine::new();
        let params = Arc::new(SessionParams::new(engine.clone(), &StreamConfig::default()));
        let connection = Arc::new(engine.new_connection("viewer-1").await.unwrap());
        let (transport, remote) = ChannelTransport::pair();
        let (feed_tx, feed_rx) = mpsc::channel(16);
        let (deregister_tx, _) = mpsc::unbounded_channel();
        let session = PeerSession::new(
            "viewer-1".to_string(),
            params,
            SignalChannel::new(transport),
            Some(connection),
            feed_rx,
            deregister_tx,
        );
        (session, engine, feed_tx, remote)
    }

    #[tokio::test]
    async fn test_forwarding_waits_for_track() {
        let (session, engine, feed_tx, _remote) = without_track().await;
        session.start_forwarding();
        assert!(session.is_running());

        feed_tx.send(Bytes::from_static(&[0x80, 96, 0, 1])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // still waiting, feed untouched
        assert!(session.inner.feed.lock().is_some());

        let track = engine
            .new_outbound_track(&session.inner.params.track)
            .unwrap();
        session.inner.track_tx.send_replace(Some(track.clone()));

        eventually(|| track.writes().len() == 1).await;
        assert_eq!(track.writes()[0][3], 1);
        assert!(session.is_running());
    }

    #[tokio::test]
    async fn test_close_while_waiting_for_track() {
        let (session, engine, _feed_tx, _remote) = without_track().await;
        session.start_forwarding();
        assert!(session.is_running());

        session.close(reason::OK).await;

        eventually(|| !session.is_running()).await;
        assert!(session.inner.feed.lock().is_some());
        assert_eq!(engine.peer(0).close_count(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_reasons() {
        let cases = [
            (
                FakeScript {
                    fail_connection: true,
                    ..Default::default()
                },
                "failed to create peer connection",
            ),
            (
                FakeScript {
                    fail_track: true,
                    ..Default::default()
                },
                "failed to create track",
            ),
            (
                FakeScript {
                    fail_offer: true,
                    ..Default::default()
                },
                "failed to create offer",
            ),
            (
                FakeScript {
                    fail_local_description: true,
                    ..Default::default()
                },
                "failed to add offer",
            ),
        ];

        for (script, expected) in cases {
            let mut h = start(script).await;
            assert!(h.session.is_err(), "{}", expected);

            let close = next_event(&mut h.remote).await;
            assert_eq!(close.event, "close");
            assert_eq!(close.payload, expected);
            assert_eq!(h.deregister_rx.recv().await.as_deref(), Some("viewer-1"));
        }
    }

    #[tokio::test]
    async fn test_offer_send_failure() {
        let mut h = {
            let engine = FakeEngine::new();
            let params = Arc::new(SessionParams::new(engine.clone(), &StreamConfig::default()));
            let (transport, remote) = ChannelTransport::pair();
            drop(remote);
            let (_feed_tx, feed_rx) = mpsc::channel(1);
            let (deregister_tx, deregister_rx) = mpsc::unbounded_channel();
            let session = PeerSession::start(
                "viewer-1".to_string(),
                params,
                SignalChannel::new(transport),
                feed_rx,
                deregister_tx,
            )
            .await;
            let err = session.err().unwrap().to_string();
            assert!(err.contains("failed to send offer"));
            (engine, deregister_rx)
        };
        assert_eq!(h.1.recv().await.as_deref(), Some("viewer-1"));
        assert_eq!(h.0.peer(0).close_count(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_under_concurrency() {
        let mut h = connected().await;
        let session = h.session.as_ref().unwrap().clone();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.close("ok").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        session.close("again").await;

        let close = next_event(&mut h.remote).await;
        assert_eq!(close.event, "close");
        assert_transport_closed(&mut h.remote).await;

        assert_eq!(h.deregister_rx.recv().await.as_deref(), Some("viewer-1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.deregister_rx.try_recv().is_err());
        assert_eq!(h.engine.peer(0).close_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_state_handling() {
        let mut h = connected().await;
        let session = h.session.as_ref().unwrap().clone();
        let peer = h.engine.peer(0);

        peer.emit_state(ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_closed());

        // a second connected report does not start another loop
        peer.emit_state(ConnectionState::Connected).await;
        h.feed_tx.send(Bytes::from_static(&[0x80, 96, 0, 7])).await.unwrap();
        let track = h.engine.track(0);
        eventually(|| track.writes().len() == 1).await;

        peer.emit_state(ConnectionState::Failed).await;
        let close = next_event(&mut h.remote).await;
        assert_eq!(close.payload, "connection failed");
        eventually(|| session.is_closed()).await;
        assert_eq!(track.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_signaling_loss_closes_session() {
        let mut h = connected().await;
        let session = h.session.as_ref().unwrap().clone();

        let RemoteEnd { tx, rx } = h.remote;
        drop(tx);
        drop(rx);

        assert_eq!(h.deregister_rx.recv().await.as_deref(), Some("viewer-1"));
        assert!(session.is_closed());
        assert_eq!(h.engine.peer(0).close_count(), 1);
    }
}
