//! Connector error type.

use thiserror::Error;
use toolwire_core::{ProtocolError, RpcError, TransportError};

use crate::connector::ConnectorState;

/// Connector error.
///
/// `Clone` so one failed connect attempt can be reported to every caller
/// awaiting it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectorError {
    #[error("Connector not connected (state: {0})")]
    NotConnected(ConnectorState),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Request {method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("Request cancelled")]
    Cancelled,
    #[error("Peer returned error: {0}")]
    Rpc(#[from] RpcError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Connect failed after {attempts} attempt(s): {reason}")]
    ConnectFailed { attempts: u32, reason: String },
}

impl From<ProtocolError> for ConnectorError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl ConnectorError {
    /// Whether the error ended the connection rather than one request.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::Transport(_)
                | Self::NotConnected(_)
                | Self::ConnectFailed { .. }
        )
    }
}
