//! Session and stream configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use toolwire_core::{OverflowPolicy, queue::DEFAULT_QUEUE_CAPACITY};

/// Session lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session expires. `None` disables expiry.
    pub idle_ttl_ms: Option<u64>,
    /// How often the sweeper purges expired sessions.
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_ms: Some(30 * 60 * 1000),
            sweep_interval_ms: 60_000,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Stream delivery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Per-session outbound queue bound.
    pub queue_capacity: usize,
    /// What to discard when the queue is full.
    pub overflow: OverflowPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}
