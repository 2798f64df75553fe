//! rtp-broadcast - fan a single live RTP stream out to WebRTC viewers
//!
//! A UDP ingest receives RTP packets from an encoder, and every browser that
//! connects to the signaling endpoint gets its own peer connection fed from
//! that one stream.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod events;
pub mod signal;
pub mod state;
pub mod utils;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
