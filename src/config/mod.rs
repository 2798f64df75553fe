//! Configuration loading
//!
//! Settings come from an optional TOML file; every section falls back to its
//! defaults, and command-line overrides are applied on top by `main`.

mod schema;

pub use schema::*;

use std::path::Path;

use crate::error::{AppError, Result};

impl AppConfig {
    /// Load configuration from a TOML file
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        let config = Self::from_toml(&text)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| AppError::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the broadcast cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.stream.mtu == 0 {
            return Err(AppError::Config("stream.mtu must be greater than 0".into()));
        }
        if self.stream.track_id.trim().is_empty() {
            return Err(AppError::Config("stream.track_id must not be empty".into()));
        }
        if self.stream.stream_id.trim().is_empty() {
            return Err(AppError::Config("stream.stream_id must not be empty".into()));
        }
        if self.broadcast.max_viewers == 0 {
            return Err(AppError::Config(
                "broadcast.max_viewers must be greater than 0".into(),
            ));
        }
        if self.broadcast.feed_capacity == 0 {
            return Err(AppError::Config(
                "broadcast.feed_capacity must be greater than 0".into(),
            ));
        }
        if self.ingest.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(AppError::Config(format!(
                "ingest.bind_address is not a socket address: {}",
                self.ingest.bind_address
            )));
        }
        Ok(())
    }
}
