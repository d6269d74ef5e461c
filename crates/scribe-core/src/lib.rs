//! Core abstractions for scribe content store access.
//!
//! This crate provides the fundamental building blocks:
//! - `ContentStore` / `Subscription` - the narrow adapter contract over a
//!   content-addressed storage network with topic pubsub
//! - `ContentId` - content identifier returned by the store
//! - `PubSubMessage` - a message received on a topic subscription
//! - `ScribeConfig` - explicit configuration passed into constructors

pub mod cid;
pub mod config;
pub mod message;
pub mod traits;

pub use cid::{ContentId, DagCodec};
pub use config::ScribeConfig;
pub use message::{PeerInfo, PubSubMessage};
pub use traits::{ContentStore, StoreError, Subscription};
