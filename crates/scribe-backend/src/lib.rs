//! Session management and content store adapters for scribe.
//!
//! Provides:
//! - `Node` - connectivity-gated session over a content store
//! - `Listener` - background delivery loop for a topic subscription
//! - Store implementations (memory, Kubo daemon RPC)

pub mod listener;
pub mod node;
pub mod storage;

pub use listener::{Listener, ListenerConfig, OverflowPolicy};
pub use node::{Node, NodeError};
