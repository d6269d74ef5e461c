//! In-memory content store.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use multibase::Base;
use multihash::{Code, MultihashDigest};
use scribe_core::{
    ContentId, ContentStore, DagCodec, PeerInfo, PubSubMessage, StoreError, Subscription,
};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

/// Per-topic broadcast buffer.
const TOPIC_CAPACITY: usize = 1024;

const RAW: u64 = 0x55;
const DAG_JSON: u64 = 0x0129;

#[derive(Debug, Clone)]
enum Block {
    Raw(Bytes),
    Dag(Value),
}

#[derive(Debug, Clone)]
struct StoredBlock {
    block: Block,
    pinned: bool,
}

/// State shared by every peer connected to the same in-memory network.
#[derive(Default)]
struct Network {
    blocks: RwLock<HashMap<ContentId, StoredBlock>>,
    topics: Mutex<HashMap<String, broadcast::Sender<PubSubMessage>>>,
    seqno: AtomicU64,
}

/// In-memory content store implementation.
///
/// Content ids are real CIDv1 values (sha2-256, base16 multibase), so
/// identical content always yields the same id. DAG objects are held as
/// canonical dag-json whatever store codec is requested, and their ids say so. Pubsub is delivered to every
/// subscriber on the same network, best effort: a subscriber that falls more
/// than the topic buffer behind sees a [`StoreError::Lagged`].
///
/// Useful for tests and single-process deployments. Data is lost on drop.
#[derive(Clone)]
pub struct MemoryStore {
    peer: Arc<PeerInfo>,
    reachable: Arc<AtomicBool>,
    network: Arc<Network>,
}

impl MemoryStore {
    /// Create a store on a fresh network with a random peer id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_network(Arc::default(), format!("mem-{}", Uuid::new_v4().simple()))
    }

    fn with_network(network: Arc<Network>, peer_id: String) -> Self {
        let addresses = vec![format!("/memory/{peer_id}")];
        Self {
            peer: Arc::new(PeerInfo {
                id: peer_id,
                addresses,
            }),
            reachable: Arc::new(AtomicBool::new(true)),
            network,
        }
    }

    /// Connect another peer to the same network.
    ///
    /// The new handle shares content and topics but has its own identity and
    /// reachability.
    #[must_use]
    pub fn connect_peer(&self, peer_id: impl Into<String>) -> Self {
        Self::with_network(Arc::clone(&self.network), peer_id.into())
    }

    /// Peer id reported by [`ContentStore::identity`].
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer.id
    }

    /// Simulate the daemon going away or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// True if the content is held and pinned.
    #[must_use]
    pub fn is_pinned(&self, id: &ContentId) -> bool {
        self.network
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .is_some_and(|b| b.pinned)
    }

    /// Number of blocks held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.network
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True if no blocks are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unreachable(self.peer.id.clone()))
        }
    }

    fn insert(&self, id: ContentId, block: Block, pin: bool) {
        let mut blocks = self
            .network
            .blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        blocks
            .entry(id)
            .and_modify(|stored| stored.pinned |= pin)
            .or_insert(StoredBlock { block, pinned: pin });
    }

    fn get(&self, id: &ContentId) -> Result<Block, StoreError> {
        self.network
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|stored| stored.block.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<PubSubMessage> {
        self.network
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the CIDv1 of `bytes` encoded with multicodec `codec`.
fn content_id(codec: u64, bytes: &[u8]) -> ContentId {
    let cid = Cid::new_v1(codec, Code::Sha2_256.digest(bytes));
    ContentId::new(multibase::encode(Base::Base16Lower, cid.to_bytes()))
}

/// Walk `/`-separated fields into a JSON value.
fn resolve<'a>(mut value: &'a Value, fields: &[&str], path: &str) -> Result<&'a Value, StoreError> {
    for field in fields {
        value = match value {
            Value::Object(map) => map.get(*field),
            Value::Array(items) => field.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
    }
    Ok(value)
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn identity(&self) -> Result<PeerInfo, StoreError> {
        self.check_reachable()?;
        Ok(PeerInfo::clone(&self.peer))
    }

    async fn add(&self, content: Bytes, pin: bool) -> Result<ContentId, StoreError> {
        self.check_reachable()?;
        let id = content_id(RAW, &content);
        self.insert(id.clone(), Block::Raw(content), pin);
        Ok(id)
    }

    async fn cat(&self, id: &ContentId) -> Result<Bytes, StoreError> {
        self.check_reachable()?;
        match self.get(id)? {
            Block::Raw(content) => Ok(content),
            Block::Dag(_) => Err(StoreError::InvalidPath(format!("{id} is not a file"))),
        }
    }

    async fn dag_put(
        &self,
        data: Bytes,
        input: DagCodec,
        format: DagCodec,
        pin: bool,
    ) -> Result<ContentId, StoreError> {
        self.check_reachable()?;
        if input != DagCodec::DagJson {
            return Err(StoreError::Decode(format!("unsupported input codec: {input}")));
        }
        let value: Value = serde_json::from_slice(&data)?;
        // serde_json maps are key-sorted, so this encoding is canonical.
        let canonical = serde_json::to_vec(&value)?;
        let id = content_id(DAG_JSON, &canonical);
        tracing::trace!(%id, %format, "stored DAG object as dag-json");
        self.insert(id.clone(), Block::Dag(value), pin);
        Ok(id)
    }

    async fn dag_get(&self, path: &str) -> Result<Value, StoreError> {
        self.check_reachable()?;
        let trimmed = path.trim_start_matches("/ipfs/").trim_matches('/');
        let mut parts = trimmed.split('/').filter(|p| !p.is_empty());
        let id = parts
            .next()
            .map(ContentId::from)
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
        let fields: Vec<&str> = parts.collect();

        match self.get(&id)? {
            Block::Dag(value) => resolve(&value, &fields, path).cloned(),
            Block::Raw(_) if fields.is_empty() => {
                Err(StoreError::Decode(format!("{id} is not a DAG object")))
            }
            Block::Raw(_) => Err(StoreError::InvalidPath(path.to_string())),
        }
    }

    async fn publish(&self, topic: &str, message: Bytes) -> Result<(), StoreError> {
        self.check_reachable()?;
        let msg = PubSubMessage {
            from: self.peer.id.clone(),
            data: message,
            seqno: self.network.seqno.fetch_add(1, Ordering::SeqCst),
            topics: vec![topic.to_string()],
        };
        // No subscribers means nobody hears it, as on a real network.
        let _ = self.topic_sender(topic).send(msg);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, StoreError> {
        self.check_reachable()?;
        Ok(Box::new(MemorySubscription {
            topic: topic.to_string(),
            rx: Some(self.topic_sender(topic).subscribe()),
        }))
    }
}

/// Subscription to a topic on a [`MemoryStore`] network.
pub struct MemorySubscription {
    topic: String,
    rx: Option<broadcast::Receiver<PubSubMessage>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next(&mut self) -> Result<PubSubMessage, StoreError> {
        let rx = self.rx.as_mut().ok_or(StoreError::SubscriptionClosed)?;
        match rx.recv().await {
            Ok(msg) => Ok(msg),
            Err(RecvError::Lagged(skipped)) => Err(StoreError::Lagged(skipped)),
            Err(RecvError::Closed) => Err(StoreError::SubscriptionClosed),
        }
    }

    async fn cancel(&mut self) -> Result<(), StoreError> {
        self.rx = None;
        Ok(())
    }
}
