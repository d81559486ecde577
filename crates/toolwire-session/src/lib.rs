//! Session storage, pub/sub fan-out and stream delivery.
//!
//! Provides:
//! - `SessionManager` - Auth-gated session lifecycle
//! - `StreamManager` - Per-session delivery of server-originated messages
//! - Storage implementations (memory, SQLite)
//! - Bus implementations (in-process)

pub mod auth;
pub mod bus;
pub mod config;
pub mod manager;
pub mod storage;
pub mod stream;

pub use auth::{AllowAll, StaticTokenVerifier};
pub use config::{SessionConfig, StreamConfig};
pub use bus::MemoryBus;
pub use manager::{IDENTITY_KEY, ManagerError, SessionManager};
pub use stream::{DeliveryError, PublishReceipt, SessionStream, StreamManager, StreamStats};
