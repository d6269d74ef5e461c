//! Peer identity and pubsub message types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity of the node behind a content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identifier.
    pub id: String,
    /// Addresses the peer is reachable on.
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Message received on a topic subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Peer id of the publisher.
    pub from: String,
    /// Raw payload.
    pub data: Bytes,
    /// Publisher-assigned sequence number.
    pub seqno: u64,
    /// Topics the message was published to.
    pub topics: Vec<String>,
}

impl PubSubMessage {
    /// Payload as UTF-8, if it is valid UTF-8.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Approximate size in bytes, used for logging.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.data.len() + self.from.len() + self.topics.iter().map(String::len).sum::<usize>()
    }
}
