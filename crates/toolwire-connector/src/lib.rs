//! Client side of the toolwire layer.
//!
//! Provides:
//! - `Connector` - Request/notify API and lifecycle over one transport
//! - `CorrelationEngine` - Pending-request table with timeouts and late-response accounting
//! - `NotificationRouter` - Ordered handlers and stream subscribers for peer messages
//! - `ConnectorRegistry` - Explicit name to connector map

pub mod config;
pub mod connector;
pub mod correlation;
pub mod error;
pub mod registry;
pub mod router;

pub use config::{ConnectorConfig, DEFAULT_CANCEL_METHOD, InitializeConfig};
pub use connector::{Connector, ConnectorState};
pub use correlation::{CorrelationEngine, EngineStats, PendingCall, Resolution};
pub use error::ConnectorError;
pub use registry::ConnectorRegistry;
pub use router::{HandlerId, InboundMessage, NotificationHandler, NotificationRouter};
