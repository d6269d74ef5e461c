//! Background delivery loop for a topic subscription.

use scribe_core::{PubSubMessage, StoreError};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::node::{NodeError, SharedSubscription};

/// Default channel capacity for messages and errors.
const DEFAULT_CAPACITY: usize = 64;

/// What the loop does when the consumer is not keeping up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for room in the channel. A slow consumer throttles ingestion;
    /// a stuck one stalls the subscription until the listener is stopped.
    #[default]
    Block,
    /// Drop the item that does not fit and keep receiving.
    DropNewest,
}

/// Listener configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Capacity of each of the message and error channels.
    pub capacity: usize,
    /// Policy when a channel is full.
    pub overflow: OverflowPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Handle to a running delivery loop.
///
/// Messages and receive errors arrive on separate bounded channels. The loop
/// stops when [`Listener::stop`] is called, the handle is dropped, the
/// subscription is cancelled, or the subscription reports it is closed.
pub struct Listener {
    topic: String,
    messages: mpsc::Receiver<PubSubMessage>,
    errors: mpsc::Receiver<NodeError>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    pub(crate) fn spawn(
        topic: String,
        subscription: SharedSubscription,
        token: CancellationToken,
        config: ListenerConfig,
    ) -> Self {
        let capacity = config.capacity.max(1);
        let (msg_tx, messages) = mpsc::channel(capacity);
        let (err_tx, errors) = mpsc::channel(capacity);

        let handle = tokio::spawn(deliver(
            topic.clone(),
            subscription,
            token.clone(),
            msg_tx,
            err_tx,
            config.overflow,
        ));

        Self {
            topic,
            messages,
            errors,
            token,
            handle: Some(handle),
        }
    }

    /// Topic being listened to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next message or receive error.
    ///
    /// Returns `None` once the loop has stopped and both channels are drained.
    pub async fn recv(&mut self) -> Option<Result<PubSubMessage, NodeError>> {
        tokio::select! {
            Some(msg) = self.messages.recv() => Some(Ok(msg)),
            Some(err) = self.errors.recv() => Some(Err(err)),
            else => None,
        }
    }

    /// Receiver for messages only.
    pub const fn messages(&mut self) -> &mut mpsc::Receiver<PubSubMessage> {
        &mut self.messages
    }

    /// Receiver for receive errors only.
    pub const fn errors(&mut self) -> &mut mpsc::Receiver<NodeError> {
        &mut self.errors
    }

    /// True once the loop task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// A receive in progress is abandoned; the subscription itself stays
    /// active on the node.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(topic = %self.topic, "Listener task failed: {e}");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn deliver(
    topic: String,
    subscription: SharedSubscription,
    token: CancellationToken,
    msg_tx: mpsc::Sender<PubSubMessage>,
    err_tx: mpsc::Sender<NodeError>,
    overflow: OverflowPolicy,
) {
    tracing::debug!(%topic, "listener started");

    loop {
        let received = tokio::select! {
            biased;
            () = token.cancelled() => break,
            res = async { subscription.lock().await.next().await } => res,
        };

        match received {
            Ok(msg) => {
                tracing::trace!(%topic, from = %msg.from, bytes = msg.approx_bytes(), "message received");
                if !forward(&msg_tx, msg, overflow, &token, &topic).await {
                    break;
                }
            }
            Err(source) => {
                let closed = matches!(source, StoreError::SubscriptionClosed);
                let err = NodeError::Receive {
                    topic: topic.clone(),
                    source,
                };
                if !forward(&err_tx, err, overflow, &token, &topic).await || closed {
                    break;
                }
            }
        }
    }

    // Frees the subscription for another listener.
    token.cancel();
    tracing::debug!(%topic, "listener stopped");
}

/// Hand an item to the consumer. Returns false when the loop should stop.
async fn forward<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    overflow: OverflowPolicy,
    token: &CancellationToken,
    topic: &str,
) -> bool {
    match overflow {
        OverflowPolicy::Block => tokio::select! {
            biased;
            () = token.cancelled() => false,
            res = tx.send(item) => res.is_ok(),
        },
        OverflowPolicy::DropNewest => match tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(%topic, "consumer is behind, dropping item");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        },
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::{Node, storage::MemoryStore};

    const WAIT: Duration = Duration::from_secs(5);

    async fn subscribed_node(topic: &str) -> Node<MemoryStore> {
        let node = Node::init(MemoryStore::new()).await.unwrap();
        node.subscribe(&CancellationToken::new(), topic).await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_message_reaches_listener() {
        let node = subscribed_node("proj1").await;
        let self_id = node.identity().await.unwrap();
        let mut listener = node.listen(ListenerConfig::default()).unwrap();

        node.publish("hello").await.unwrap();

        let msg = timeout(WAIT, listener.recv()).await.unwrap().unwrap().unwrap();
        assert_eq!(msg.text(), Some("hello"));
        assert_eq!(msg.from, self_id.id);
        assert_eq!(msg.topics, vec!["proj1".to_string()]);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_message_from_other_peer() {
        let node_a = subscribed_node("proj1").await;
        let node_b = Node::init(node_a.store().connect_peer("peer-b")).await.unwrap();
        node_b.set_project("proj1").unwrap();
        let mut listener = node_a.listen(ListenerConfig::default()).unwrap();

        node_b.publish("hello").await.unwrap();

        let msg = timeout(WAIT, listener.messages().recv()).await.unwrap().unwrap();
        assert_eq!(msg.text(), Some("hello"));
        assert_eq!(msg.from, "peer-b");
    }

    #[tokio::test]
    async fn test_preserves_arrival_order() {
        let node = subscribed_node("proj1").await;
        let mut listener = node.listen(ListenerConfig::default()).unwrap();

        for i in 0..10 {
            node.publish(format!("msg-{i}")).await.unwrap();
        }
        for i in 0..10 {
            let msg = timeout(WAIT, listener.messages().recv()).await.unwrap().unwrap();
            assert_eq!(msg.text(), Some(format!("msg-{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn test_stop_unblocks_pending_receive() {
        let node = subscribed_node("proj1").await;
        let listener = node.listen(ListenerConfig::default()).unwrap();

        // Nothing is published, so the loop is parked in a receive.
        timeout(WAIT, listener.stop()).await.unwrap();
        assert!(node.is_subscribed());
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_listener() {
        let node = subscribed_node("proj1").await;
        let mut listener = node.listen(ListenerConfig::default()).unwrap();

        node.unsubscribe().await.unwrap();

        assert!(timeout(WAIT, listener.recv()).await.unwrap().is_none());
        timeout(WAIT, listener.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_token_ends_listener() {
        let node = Node::init(MemoryStore::new()).await.unwrap();
        let cancel = CancellationToken::new();
        node.subscribe(&cancel, "proj1").await.unwrap();
        let mut listener = node.listen(ListenerConfig::default()).unwrap();

        cancel.cancel();
        assert!(timeout(WAIT, listener.recv()).await.unwrap().is_none());
        assert!(node.listen(ListenerConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_drop_newest_keeps_receiving() {
        let node = subscribed_node("proj1").await;
        let config = ListenerConfig {
            capacity: 1,
            overflow: OverflowPolicy::DropNewest,
        };
        let mut listener = node.listen(config).unwrap();

        node.publish("first").await.unwrap();
        let msg = timeout(WAIT, listener.messages().recv()).await.unwrap().unwrap();
        assert_eq!(msg.text(), Some("first"));

        // Fill the channel without draining it; later items are dropped
        // rather than stalling the loop.
        for i in 0..5 {
            node.publish(format!("burst-{i}")).await.unwrap();
        }
        let msg = timeout(WAIT, listener.messages().recv()).await.unwrap().unwrap();
        assert_eq!(msg.text(), Some("burst-0"));

        node.publish("after").await.unwrap();
        let msg = timeout(WAIT, listener.messages().recv()).await.unwrap().unwrap();
        assert!(msg.text().is_some_and(|t| t.starts_with("burst-") || t == "after"));
    }
}
