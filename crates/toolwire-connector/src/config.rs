//! Connector configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolwire_core::BackoffPolicy;

/// Default method used to tell the peer an in-flight request was cancelled.
pub const DEFAULT_CANCEL_METHOD: &str = "notifications/cancelled";

/// Connector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Deadline applied to requests sent without an explicit timeout.
    pub request_timeout_ms: u64,
    /// Bound on a single transport connect attempt.
    pub connect_timeout_ms: u64,
    /// Reconnect schedule after an unexpected close. `None` disables reconnect.
    pub reconnect: Option<BackoffPolicy>,
    /// Handshake performed on every successful connect.
    pub initialize: Option<InitializeConfig>,
    /// Notification sent to the peer when a request is cancelled locally.
    pub cancel_method: Option<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            reconnect: None,
            initialize: None,
            cancel_method: Some(DEFAULT_CANCEL_METHOD.to_string()),
        }
    }
}

impl ConnectorConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, policy: BackoffPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    #[must_use]
    pub fn with_initialize(mut self, initialize: InitializeConfig) -> Self {
        self.initialize = Some(initialize);
        self
    }
}

/// Initialize handshake: one request whose result is kept as the peer's
/// info, followed by an optional notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializeConfig {
    pub method: String,
    pub params: Option<Value>,
    pub initialized_method: Option<String>,
}

impl Default for InitializeConfig {
    fn default() -> Self {
        Self {
            method: "initialize".to_string(),
            params: None,
            initialized_method: Some("notifications/initialized".to_string()),
        }
    }
}

impl InitializeConfig {
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectorConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.cancel_method.as_deref(), Some(DEFAULT_CANCEL_METHOD));
        assert!(config.reconnect.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ConnectorConfig = serde_json::from_str(
            r#"{"request_timeout_ms": 500, "reconnect": {"max_attempts": 2}, "initialize": {}}"#,
        )
        .unwrap();
        assert_eq!(config.request_timeout_ms, 500);
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.reconnect.unwrap().max_attempts, 2);
        assert_eq!(config.initialize.unwrap().method, "initialize");
    }
}
