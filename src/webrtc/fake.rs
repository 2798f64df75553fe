//! Scripted negotiation engine for session tests
//!
//! Every connection and track the engine hands out is recorded so tests can
//! inspect what a session did and drive engine callbacks by hand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::engine::{
    EngineConnection, FeedbackSource, NegotiationEngine, OnIceCandidateFn, OnStateChangeFn,
    OutboundTrack, TrackSpec,
};
use super::signaling::{ConnectionState, IceCandidate, SessionDescription};
use crate::error::{AppError, Result};

pub const FAKE_OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=fake offer\r\n";
pub const FAKE_ANSWER_SDP: &str = "v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\ns=fake answer\r\n";

/// Engine steps that should fail
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    pub fail_connection: bool,
    pub fail_track: bool,
    pub fail_add_track: bool,
    pub fail_offer: bool,
    pub fail_local_description: bool,
    pub fail_remote_description: bool,
    pub fail_candidate: bool,
    pub fail_write: bool,
    /// Report `Connected` from inside `add_track`, before the track is usable
    pub connect_during_add_track: bool,
}

#[derive(Clone, Default)]
pub struct FakeEngine {
    script: FakeScript,
    peers: Arc<Mutex<Vec<Arc<FakePeer>>>>,
    tracks: Arc<Mutex<Vec<Arc<FakeTrack>>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: FakeScript) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    /// Recorded state of the `index`th connection
    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        self.peers.lock()[index].clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn track(&self, index: usize) -> Arc<FakeTrack> {
        self.tracks.lock()[index].clone()
    }
}

#[async_trait]
impl NegotiationEngine for FakeEngine {
    type Track = FakeTrack;
    type Connection = FakeConnection;

    async fn new_connection(&self, _session_id: &str) -> Result<FakeConnection> {
        if self.script.fail_connection {
            return Err(AppError::WebRtc("scripted connection failure".to_string()));
        }
        let peer = Arc::new(FakePeer::default());
        self.peers.lock().push(peer.clone());
        Ok(FakeConnection {
            peer,
            script: self.script.clone(),
        })
    }

    fn new_outbound_track(&self, _spec: &TrackSpec) -> Result<Arc<FakeTrack>> {
        if self.script.fail_track {
            return Err(AppError::WebRtc("scripted track failure".to_string()));
        }
        let track = Arc::new(FakeTrack {
            writes: Mutex::new(Vec::new()),
            fail: self.script.fail_write,
        });
        self.tracks.lock().push(track.clone());
        Ok(track)
    }
}

/// What a session did to one connection, plus its registered callbacks
#[derive(Default)]
pub struct FakePeer {
    local_descriptions: Mutex<Vec<SessionDescription>>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    tracks_added: AtomicUsize,
    close_count: AtomicUsize,
    closed: CancellationToken,
    on_ice: Mutex<Option<OnIceCandidateFn>>,
    on_state: Mutex<Option<OnStateChangeFn>>,
}

impl FakePeer {
    /// Invoke the session's state callback as the engine would
    pub async fn emit_state(&self, state: ConnectionState) {
        let fut = self.on_state.lock().as_mut().map(|handler| handler(state));
        if let Some(fut) = fut {
            fut.await;
        }
    }

    /// Invoke the session's local-candidate callback as the engine would
    pub async fn emit_candidate(&self, candidate: Option<IceCandidate>) {
        let fut = self.on_ice.lock().as_mut().map(|handler| handler(candidate));
        if let Some(fut) = fut {
            fut.await;
        }
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.local_descriptions.lock().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn tracks_added(&self) -> usize {
        self.tracks_added.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

pub struct FakeConnection {
    peer: Arc<FakePeer>,
    script: FakeScript,
}

fn scripted(fail: bool, step: &str) -> Result<()> {
    if fail {
        return Err(AppError::WebRtc(format!("scripted {} failure", step)));
    }
    Ok(())
}

#[async_trait]
impl EngineConnection for FakeConnection {
    type Track = FakeTrack;
    type Feedback = FakeFeedback;

    async fn add_track(&self, _track: Arc<FakeTrack>) -> Result<FakeFeedback> {
        scripted(self.script.fail_add_track, "add track")?;
        self.peer.tracks_added.fetch_add(1, Ordering::SeqCst);
        if self.script.connect_during_add_track {
            self.peer.emit_state(ConnectionState::Connected).await;
        }
        Ok(FakeFeedback {
            closed: self.peer.closed.clone(),
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        scripted(self.script.fail_offer, "offer")?;
        Ok(SessionDescription::offer(FAKE_OFFER_SDP))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        scripted(self.script.fail_local_description, "local description")?;
        self.peer.local_descriptions.lock().push(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        scripted(self.script.fail_remote_description, "remote description")?;
        self.peer.remote_descriptions.lock().push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        scripted(self.script.fail_candidate, "candidate")?;
        self.peer.candidates.lock().push(candidate);
        Ok(())
    }

    fn on_ice_candidate(&self, handler: OnIceCandidateFn) {
        *self.peer.on_ice.lock() = Some(handler);
    }

    fn on_connection_state_change(&self, handler: OnStateChangeFn) {
        *self.peer.on_state.lock() = Some(handler);
    }

    async fn close(&self) -> Result<()> {
        self.peer.close_count.fetch_add(1, Ordering::SeqCst);
        self.peer.closed.cancel();
        Ok(())
    }
}

pub struct FakeTrack {
    writes: Mutex<Vec<Bytes>>,
    fail: bool,
}

impl FakeTrack {
    pub fn writes(&self) -> Vec<Bytes> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl OutboundTrack for FakeTrack {
    async fn write(&self, packet: &[u8]) -> Result<usize> {
        scripted(self.fail, "write")?;
        self.writes.lock().push(Bytes::copy_from_slice(packet));
        Ok(packet.len())
    }
}

/// Blocks until the owning connection is closed, then errors
pub struct FakeFeedback {
    closed: CancellationToken,
}

#[async_trait]
impl FeedbackSource for FakeFeedback {
    async fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        self.closed.cancelled().await;
        Err(AppError::WebRtc("sender closed".to_string()))
    }
}

/// Poll `check` until it holds, panicking after one second
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 1s");
}
