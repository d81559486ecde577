//! Storage implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "memory")]
pub use memory::MemorySessionStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSessionStore;
