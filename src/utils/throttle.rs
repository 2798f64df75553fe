//! Log throttling
//!
//! Limits how often a repeated message is logged and counts what was
//! suppressed in between, so a flood of bad datagrams costs one log line per
//! interval.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Per-key rate limiter for log messages
///
/// # Example
///
/// ```rust
/// use rtp_broadcast::utils::LogThrottler;
///
/// let throttler = LogThrottler::with_secs(5);
///
/// assert!(throttler.should_log("invalid_rtp"));
/// assert!(!throttler.should_log("invalid_rtp"));
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Whether a message for `key` may be logged now
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// `Some(n)` when a message for `key` may be logged now, where `n` is the
    /// number of messages suppressed since the last one; `None` otherwise
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                entry.last_logged = now;
                Some(std::mem::take(&mut entry.suppressed))
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
///
/// ```rust
/// use rtp_broadcast::utils::LogThrottler;
/// use rtp_broadcast::warn_throttled;
///
/// let throttler = LogThrottler::default();
/// warn_throttled!(throttler, "bad_packet", "Dropping packet: {}", "too short");
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}
