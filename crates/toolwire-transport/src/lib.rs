//! Client transports and the server accept path.
//!
//! Provides:
//! - `PipeTransport` - Child process speaking newline-delimited JSON
//! - `HttpTransport` - Request/response over HTTP plus an SSE stream (feature: http)
//! - `SocketTransport` - Full-duplex WebSocket (feature: socket)
//! - `server` - axum router terminating WebSocket and HTTP/SSE clients (feature: server)

pub mod pipe;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "socket")]
pub mod socket;

#[cfg(feature = "server")]
pub mod server;

pub use pipe::{PipeCommand, PipeTransport};

#[cfg(feature = "http")]
pub use http::{HttpTransport, HttpTransportConfig};

#[cfg(feature = "socket")]
pub use socket::{SocketTransport, SocketTransportConfig};

/// Method of the first notification a server sends on a new socket.
pub const SESSION_NOTIFICATION: &str = "notifications/session";

/// Method carrying stream messages to the client.
pub const STREAM_NOTIFICATION: &str = "notifications/stream";
