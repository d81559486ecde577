//! Pub/sub bus implementations.

pub mod memory;

pub use memory::MemoryBus;
