//! Content store implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "kubo")]
pub mod kubo;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

#[cfg(feature = "kubo")]
pub use kubo::KuboStore;
