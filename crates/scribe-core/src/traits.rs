//! Content store adapter contract.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::{ContentId, DagCodec, PeerInfo, PubSubMessage};

/// Content store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unreachable: {0}")]
    Unreachable(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Store returned {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Content not found: {0}")]
    NotFound(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Subscription closed")]
    SubscriptionClosed,
    #[error("Subscription lagged, {0} messages skipped")]
    Lagged(u64),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Live handle to a topic subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Topic this handle is subscribed to.
    fn topic(&self) -> &str;

    /// Wait for the next message.
    ///
    /// Blocks until a message arrives, the subscription is closed, or the
    /// transport fails. Must be cancel safe: dropping the future before it
    /// completes loses no message already handed to the caller.
    async fn next(&mut self) -> Result<PubSubMessage, StoreError>;

    /// Cancel the subscription.
    ///
    /// Idempotent; after cancellation `next` returns
    /// [`StoreError::SubscriptionClosed`].
    async fn cancel(&mut self) -> Result<(), StoreError>;
}

/// Trait for content-addressed storage backends with topic pubsub.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Liveness probe.
    async fn is_reachable(&self) -> bool;

    /// Identity of the node behind the store.
    async fn identity(&self) -> Result<PeerInfo, StoreError>;

    /// Store a blob, pinning it if requested.
    async fn add(&self, content: Bytes, pin: bool) -> Result<ContentId, StoreError>;

    /// Read a blob back.
    async fn cat(&self, id: &ContentId) -> Result<Bytes, StoreError>;

    /// Store a structured object.
    ///
    /// `data` is encoded with `input`, stored with `format`.
    async fn dag_put(
        &self,
        data: Bytes,
        input: DagCodec,
        format: DagCodec,
        pin: bool,
    ) -> Result<ContentId, StoreError>;

    /// Read a structured object (or a sub-path of one) as JSON.
    ///
    /// `path` is a content id optionally followed by `/`-separated fields.
    async fn dag_get(&self, path: &str) -> Result<Value, StoreError>;

    /// Publish a message to a topic.
    async fn publish(&self, topic: &str, message: Bytes) -> Result<(), StoreError>;

    /// Subscribe to a topic.
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, StoreError>;
}
