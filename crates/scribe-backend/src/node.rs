//! Node for gating content store access and owning the topic subscription.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use scribe_core::{ContentId, ContentStore, DagCodec, PeerInfo, StoreError, Subscription};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::listener::{Listener, ListenerConfig};

/// Node error.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Node is offline")]
    Offline,
    #[error("Node has no registered project")]
    NoProject,
    #[error("Node is already subscribed to {0}")]
    AlreadySubscribed(String),
    #[error("Node has no active subscription")]
    NotSubscribed,
    #[error("A listener is already running for {0}")]
    AlreadyListening(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Failed to wait for pubsub message on {topic}: {source}")]
    Receive {
        topic: String,
        #[source]
        source: StoreError,
    },
}

/// Subscription handle shared between the node and its listener.
pub(crate) type SharedSubscription = Arc<tokio::sync::Mutex<Box<dyn Subscription>>>;

/// Active subscription state.
#[derive(Clone)]
struct ActiveSubscription {
    topic: String,
    token: CancellationToken,
    handle: SharedSubscription,
    /// Token of the delivery loop, if one was started.
    listener: Option<CancellationToken>,
}

impl ActiveSubscription {
    fn is_live(&self) -> bool {
        !self.token.is_cancelled()
    }

    fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(|t| !t.is_cancelled())
    }
}

#[derive(Default)]
struct NodeState {
    allow_network: bool,
    identity: Option<PeerInfo>,
    project: Option<String>,
    subscription: Option<ActiveSubscription>,
}

impl NodeState {
    fn live_subscription(&self) -> Option<&ActiveSubscription> {
        self.subscription.as_ref().filter(|s| s.is_live())
    }
}

/// A session over one content store.
///
/// All state sits behind a single lock which is only held while fields are
/// read or written, never across a store call. Dropping the node cancels its
/// subscription.
pub struct Node<S: ContentStore> {
    store: S,
    state: Arc<Mutex<NodeState>>,
}

impl<S: ContentStore> Node<S> {
    /// Create a node over `store`.
    ///
    /// # Errors
    /// Returns [`NodeError::Offline`] if the store is not reachable. There is
    /// no retry; the caller decides whether to start the daemon and try again.
    pub async fn init(store: S) -> Result<Self, NodeError> {
        let node = Self {
            store,
            state: Arc::new(Mutex::new(NodeState {
                allow_network: true,
                ..NodeState::default()
            })),
        };
        if !node.is_online().await {
            return Err(NodeError::Offline);
        }
        tracing::debug!("node initialised");
        Ok(node)
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        lock(&self.state)
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Allow the node to use the network.
    pub fn connect(&self) {
        self.state().allow_network = true;
    }

    /// Prevent the node from using the network.
    pub fn disconnect(&self) {
        self.state().allow_network = false;
    }

    /// True if the node is allowed on the network and the store is reachable.
    ///
    /// Reachability is probed on every call.
    pub async fn is_online(&self) -> bool {
        let allow_network = self.state().allow_network;
        allow_network && self.store.is_reachable().await
    }

    async fn ensure_online(&self) -> Result<(), NodeError> {
        if self.is_online().await {
            Ok(())
        } else {
            Err(NodeError::Offline)
        }
    }

    /// The identity of the node behind the store.
    ///
    /// Cached after the first successful fetch. Concurrent first calls may
    /// each fetch; the last write wins, which is fine as identity is stable.
    ///
    /// # Errors
    /// Returns error if the store cannot report its identity.
    pub async fn identity(&self) -> Result<PeerInfo, NodeError> {
        let cached = self.state().identity.clone();
        if let Some(identity) = cached {
            return Ok(identity);
        }

        let identity = self.store.identity().await?;
        self.state().identity = Some(identity.clone());
        Ok(identity)
    }

    /// Register the node with a project.
    ///
    /// An empty name unregisters the node.
    ///
    /// # Errors
    /// Returns [`NodeError::AlreadySubscribed`] if the node holds a live
    /// subscription to a different topic.
    pub fn set_project(&self, project: impl Into<String>) -> Result<(), NodeError> {
        let project = project.into();
        let mut state = self.state();
        if let Some(active) = state.live_subscription() {
            if active.topic != project {
                return Err(NodeError::AlreadySubscribed(active.topic.clone()));
            }
        }
        state.project = Some(project).filter(|p| !p.is_empty());
        Ok(())
    }

    /// The project the node is registered with.
    #[must_use]
    pub fn project(&self) -> Option<String> {
        self.state().project.clone()
    }

    /// True if the node holds a live subscription.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.state().live_subscription().is_some()
    }

    /// Publish a message about the registered project.
    ///
    /// # Errors
    /// Returns [`NodeError::Offline`] when offline, [`NodeError::NoProject`]
    /// when no project is registered, or the store's publish error.
    pub async fn publish(&self, message: impl Into<Bytes>) -> Result<(), NodeError> {
        self.ensure_online().await?;
        let project = self.project().ok_or(NodeError::NoProject)?;
        self.store.publish(&project, message.into()).await?;
        tracing::debug!(%project, "published message");
        Ok(())
    }

    /// Subscribe the node to a project topic.
    ///
    /// The subscription lives until [`Node::unsubscribe`] is called or
    /// `cancel` fires; either tears down the store subscription and
    /// unblocks any listener waiting on it.
    ///
    /// # Errors
    /// Returns [`NodeError::Offline`] when offline,
    /// [`NodeError::AlreadySubscribed`] if a live subscription exists, or the
    /// store's subscribe error.
    pub async fn subscribe(&self, cancel: &CancellationToken, topic: &str) -> Result<(), NodeError> {
        self.ensure_online().await?;
        let existing = self.state().live_subscription().map(|s| s.topic.clone());
        if let Some(existing) = existing {
            return Err(NodeError::AlreadySubscribed(existing));
        }

        let handle = self.store.subscribe(topic).await?;
        let active = ActiveSubscription {
            topic: topic.to_string(),
            token: cancel.child_token(),
            handle: Arc::new(tokio::sync::Mutex::new(handle)),
            listener: None,
        };

        let conflict = {
            let mut state = self.state();
            match state.live_subscription() {
                Some(existing) => Some(existing.topic.clone()),
                None => {
                    state.subscription = Some(active.clone());
                    state.project = Some(active.topic.clone());
                    None
                }
            }
        };
        if let Some(existing) = conflict {
            // Lost a race with a concurrent subscribe.
            active.token.cancel();
            active.handle.lock().await.cancel().await?;
            return Err(NodeError::AlreadySubscribed(existing));
        }

        tokio::spawn(teardown_on_cancel(
            Arc::downgrade(&self.state),
            active.token.clone(),
            active.handle,
        ));
        tracing::info!(%topic, "subscribed");
        Ok(())
    }

    /// Unsubscribe the node.
    ///
    /// Clears both the subscription and the registered project. Succeeds
    /// without doing anything when neither is set.
    ///
    /// # Errors
    /// Returns [`NodeError::Offline`] when offline, or the store's cancel
    /// error. The node is unsubscribed even if the store reports an error.
    pub async fn unsubscribe(&self) -> Result<(), NodeError> {
        self.ensure_online().await?;
        let active = {
            let mut state = self.state();
            state.project = None;
            state.subscription.take()
        };

        if let Some(active) = active {
            active.token.cancel();
            active.handle.lock().await.cancel().await?;
            tracing::info!(topic = %active.topic, "unsubscribed");
        }
        Ok(())
    }

    /// Start the delivery loop for the active subscription.
    ///
    /// Only one loop runs per subscription. Another may be started once the
    /// previous one has been stopped, dropped or has ended.
    ///
    /// # Errors
    /// Returns [`NodeError::NotSubscribed`] without a live subscription, or
    /// [`NodeError::AlreadyListening`] while a loop is running.
    pub fn listen(&self, config: ListenerConfig) -> Result<Listener, NodeError> {
        let mut state = self.state();
        let active = state
            .subscription
            .as_mut()
            .filter(|s| s.is_live())
            .ok_or(NodeError::NotSubscribed)?;
        if active.is_listening() {
            return Err(NodeError::AlreadyListening(active.topic.clone()));
        }

        let token = active.token.child_token();
        active.listener = Some(token.clone());
        Ok(Listener::spawn(
            active.topic.clone(),
            Arc::clone(&active.handle),
            token,
            config,
        ))
    }

    /// Add content to the store, pinning it if instructed.
    ///
    /// # Errors
    /// Returns [`NodeError::Offline`] when offline, or the store's error.
    pub async fn add(&self, content: impl Into<Bytes>, pin: bool) -> Result<ContentId, NodeError> {
        self.ensure_online().await?;
        Ok(self.store.add(content.into(), pin).await?)
    }

    /// Read the content for an id.
    ///
    /// # Errors
    /// Returns [`NodeError::Offline`] when offline, or the store's error.
    pub async fn cat(&self, id: &ContentId) -> Result<Bytes, NodeError> {
        self.ensure_online().await?;
        Ok(self.store.cat(id).await?)
    }

    /// Store a structured object.
    ///
    /// # Errors
    /// Returns [`NodeError::Offline`] when offline, or the store's error.
    pub async fn dag_put(
        &self,
        data: impl Into<Bytes>,
        encoding: DagCodec,
        format: DagCodec,
        pin: bool,
    ) -> Result<ContentId, NodeError> {
        self.ensure_online().await?;
        let id = self.store.dag_put(data.into(), encoding, format, pin).await?;
        tracing::debug!(%id, %format, pin, "stored DAG object");
        Ok(id)
    }

    /// Read a structured object, or the sub-path `field` of one, into `T`.
    ///
    /// # Errors
    /// Returns [`NodeError::Offline`] when offline, the store's error, or a
    /// decode error if the object does not match `T`.
    pub async fn dag_get<T: DeserializeOwned>(
        &self,
        id: &ContentId,
        field: &str,
    ) -> Result<T, NodeError> {
        self.ensure_online().await?;
        let value = self.store.dag_get(&id.path(field)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Announce `name` to the network as a raw block.
    ///
    /// # Errors
    /// Returns [`NodeError::Offline`] when offline, or the store's error.
    pub async fn publish_name(&self, name: &str) -> Result<ContentId, NodeError> {
        self.ensure_online().await?;
        let key = self
            .store
            .add(Bytes::from(format!("scribe:{name}")), false)
            .await?;
        tracing::debug!(%name, %key, "published name");
        Ok(key)
    }
}

impl<S: ContentStore> Drop for Node<S> {
    fn drop(&mut self) {
        let active = self.state().subscription.take();
        if let Some(active) = active {
            active.token.cancel();
        }
    }
}

fn lock(state: &Mutex<NodeState>) -> MutexGuard<'_, NodeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait for `token`, then drop the subscription from the node and cancel it
/// on the store.
async fn teardown_on_cancel(
    state: Weak<Mutex<NodeState>>,
    token: CancellationToken,
    handle: SharedSubscription,
) {
    token.cancelled().await;
    if let Some(state) = state.upgrade() {
        let mut state = lock(&state);
        // Only if it has not been replaced or cleared already.
        if state
            .subscription
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(&s.handle, &handle))
        {
            state.subscription = None;
            state.project = None;
        }
    }

    let mut subscription = handle.lock().await;
    if let Err(e) = subscription.cancel().await {
        tracing::warn!(topic = %subscription.topic(), "Failed to cancel subscription: {e}");
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::storage::MemoryStore;

    const WAIT: Duration = Duration::from_secs(5);

    async fn online_node() -> Node<MemoryStore> {
        Node::init(MemoryStore::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_init_requires_reachable_store() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let err = Node::init(store).await.err().unwrap();
        assert!(matches!(err, NodeError::Offline));
    }

    #[tokio::test]
    async fn test_connectivity_gating() {
        let node = online_node().await;
        node.disconnect();
        assert!(!node.is_online().await);

        node.connect();
        assert!(node.is_online().await);

        node.store().set_reachable(false);
        assert!(!node.is_online().await);
        node.store().set_reachable(true);
        assert!(node.is_online().await);
    }

    #[tokio::test]
    async fn test_disconnected_ops_fail_offline() {
        let node = online_node().await;
        node.set_project("proj1").unwrap();
        node.disconnect();

        assert!(matches!(node.publish("hi").await, Err(NodeError::Offline)));
        assert!(matches!(node.add("data", false).await, Err(NodeError::Offline)));
        assert!(matches!(
            node.cat(&ContentId::new("f01")).await,
            Err(NodeError::Offline)
        ));
        assert!(matches!(
            node.subscribe(&CancellationToken::new(), "proj1").await,
            Err(NodeError::Offline)
        ));
        assert!(matches!(node.unsubscribe().await, Err(NodeError::Offline)));
    }

    #[tokio::test]
    async fn test_identity_is_cached() {
        let node = online_node().await;
        let first = node.identity().await.unwrap();
        let second = node.identity().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.id, node.store().peer_id());

        // Cached identity survives the store going away.
        node.store().set_reachable(false);
        assert_eq!(node.identity().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_publish_without_project() {
        let node = online_node().await;
        assert!(matches!(node.publish("hi").await, Err(NodeError::NoProject)));

        node.set_project("proj1").unwrap();
        assert_ok!(node.publish("hi").await);

        node.set_project("").unwrap();
        assert!(node.project().is_none());
        assert!(matches!(node.publish("hi").await, Err(NodeError::NoProject)));
    }

    #[tokio::test]
    async fn test_subscribe_sets_project_and_unsubscribe_clears_it() {
        let node = online_node().await;
        let cancel = CancellationToken::new();

        node.subscribe(&cancel, "proj1").await.unwrap();
        assert!(node.is_subscribed());
        assert_eq!(node.project().as_deref(), Some("proj1"));

        node.unsubscribe().await.unwrap();
        assert!(!node.is_subscribed());
        assert!(node.project().is_none());

        // Unsubscribing again is a no-op.
        assert_ok!(node.unsubscribe().await);
    }

    #[tokio::test]
    async fn test_second_subscribe_fails() {
        let node = online_node().await;
        let cancel = CancellationToken::new();
        node.subscribe(&cancel, "proj1").await.unwrap();

        let err = node.subscribe(&cancel, "proj2").await.unwrap_err();
        assert!(matches!(err, NodeError::AlreadySubscribed(topic) if topic == "proj1"));

        assert_err!(node.set_project("proj2"));
        assert_ok!(node.set_project("proj1"));

        node.unsubscribe().await.unwrap();
        assert_ok!(node.subscribe(&cancel, "proj2").await);
    }

    async fn wait_for_no_project(node: &Node<MemoryStore>) {
        timeout(WAIT, async {
            while node.project().is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_token_ends_subscription() {
        let node = online_node().await;
        let cancel = CancellationToken::new();
        node.subscribe(&cancel, "proj1").await.unwrap();

        cancel.cancel();
        assert!(!node.is_subscribed());
        wait_for_no_project(&node).await;

        // A fresh subscription may replace the cancelled one.
        assert_ok!(node.subscribe(&CancellationToken::new(), "proj2").await);
        assert_eq!(node.project().as_deref(), Some("proj2"));
    }

    #[tokio::test]
    async fn test_cancel_token_drops_subscription_handle() {
        let node = online_node().await;
        let cancel = CancellationToken::new();
        node.subscribe(&cancel, "proj1").await.unwrap();

        cancel.cancel();
        wait_for_no_project(&node).await;
        assert!(node.state().subscription.is_none());
        assert_ok!(node.unsubscribe().await);
    }

    #[tokio::test]
    async fn test_listen_requires_subscription() {
        let node = online_node().await;
        let err = node.listen(ListenerConfig::default()).err().unwrap();
        assert!(matches!(err, NodeError::NotSubscribed));
    }

    #[tokio::test]
    async fn test_single_listener_per_subscription() {
        let node = online_node().await;
        node.subscribe(&CancellationToken::new(), "proj1").await.unwrap();

        let listener = node.listen(ListenerConfig::default()).unwrap();
        let err = node.listen(ListenerConfig::default()).err().unwrap();
        assert!(matches!(err, NodeError::AlreadyListening(topic) if topic == "proj1"));

        timeout(WAIT, listener.stop()).await.unwrap();
        let listener = node.listen(ListenerConfig::default()).unwrap();

        // Dropping the handle frees the slot too.
        drop(listener);
        assert_ok!(node.listen(ListenerConfig::default()));
    }

    #[tokio::test]
    async fn test_drop_node_ends_listener() {
        let node = online_node().await;
        node.subscribe(&CancellationToken::new(), "proj1").await.unwrap();
        let mut listener = node.listen(ListenerConfig::default()).unwrap();

        drop(node);
        assert!(timeout(WAIT, listener.recv()).await.unwrap().is_none());
        timeout(WAIT, listener.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_cat_roundtrip() {
        let node = online_node().await;
        let data = br#"{"fieldA":"test field","fieldB":666}"#.to_vec();

        let id = node.add(data.clone(), true).await.unwrap();
        assert!(node.store().is_pinned(&id));
        assert_eq!(node.cat(&id).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_dag_get_field() {
        #[derive(serde::Deserialize)]
        struct Doc {
            label: String,
        }

        let node = online_node().await;
        let id = node
            .dag_put(
                r#"{"label":"alpha","nested":{"count":2}}"#,
                DagCodec::DagJson,
                DagCodec::DagCbor,
                false,
            )
            .await
            .unwrap();

        let doc: Doc = node.dag_get(&id, "").await.unwrap();
        assert_eq!(doc.label, "alpha");
        let count: u32 = node.dag_get(&id, "nested/count").await.unwrap();
        assert_eq!(count, 2);
        assert!(matches!(
            node.dag_get::<String>(&id, "missing").await,
            Err(NodeError::Store(StoreError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_publish_name() {
        let node = online_node().await;
        let key = node.publish_name("alpha").await.unwrap();
        assert_eq!(node.cat(&key).await.unwrap(), "scribe:alpha".as_bytes());
    }
}
