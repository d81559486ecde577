//! Core abstractions for the toolwire transport and session layer.
//!
//! This crate provides the fundamental building blocks:
//! - `Frame` - Wire message model and classification
//! - `Transport` - Contract every connection kind implements
//! - `ChannelTransport` - In-process duplex transport pair
//! - `StreamQueue` - Bounded per-session outbound queue
//! - `BackoffPolicy` - Reconnect delay schedule
//! - Session store, pub/sub bus and auth verifier traits

pub mod backoff;
pub mod channel;
pub mod message;
pub mod queue;
pub mod session;
pub mod traits;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use channel::ChannelTransport;
pub use message::{Frame, Notification, ProtocolError, Request, RequestId, Response, RpcError};
pub use queue::{OverflowPolicy, PushOutcome, StreamQueue};
pub use session::{Metadata, SessionId, SessionRecord, StreamMessage};
pub use traits::{
    AuthError, AuthVerifier, BusError, BusSubscription, Identity, PubSubBus, SessionError,
    SessionStore,
};
pub use transport::{EventSink, InboundEvents, Transport, TransportError, TransportEvent, TransportKind};

/// Header carrying the session token on HTTP and WebSocket exchanges.
pub const SESSION_HEADER: &str = "x-session-id";
