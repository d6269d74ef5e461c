//! Kubo daemon RPC content store (feature-gated).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use multibase::Base;
use reqwest::{
    Client, Response,
    multipart::{Form, Part},
};
use scribe_core::{
    ContentId, ContentStore, DagCodec, PeerInfo, PubSubMessage, ScribeConfig, StoreError,
    Subscription,
};
use serde::Deserialize;
use serde_json::Value;

/// Multihash used for everything this store writes.
const MULTIHASH: &str = "sha2-256";

/// Liveness probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Content store backed by a Kubo-compatible daemon's HTTP RPC API.
#[derive(Debug, Clone)]
pub struct KuboStore {
    client: Client,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Addresses", default)]
    addresses: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct DagLink {
    #[serde(rename = "/")]
    cid: String,
}

#[derive(Debug, Deserialize)]
struct DagPutResponse {
    #[serde(rename = "Cid")]
    cid: DagLink,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubMessage {
    from: String,
    #[serde(default)]
    data: String,
    #[serde(default)]
    seqno: String,
    #[serde(rename = "topicIDs", default)]
    topic_ids: Vec<String>,
}

impl KuboStore {
    /// Create a store talking to the RPC API at `api_url`
    /// (e.g. `http://127.0.0.1:5001/api/v0`).
    #[must_use]
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create a store for the API address in `config`.
    #[must_use]
    pub fn from_config(config: &ScribeConfig) -> Self {
        Self::new(config.api_url())
    }

    /// Base URL of the RPC API.
    #[must_use]
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn url(&self, command: &str) -> String {
        format!("{}/{command}", self.api_url)
    }

    async fn call(
        &self,
        command: &str,
        query: &[(&str, &str)],
        body: Option<Bytes>,
    ) -> Result<Response, StoreError> {
        let mut request = self.client.post(self.url(command)).query(query);
        if let Some(body) = body {
            let part = Part::bytes(body.to_vec()).file_name("data");
            request = request.multipart(Form::new().part("file", part));
        }
        let response = request.send().await.map_err(http_error)?;
        check_status(response).await
    }
}

fn http_error(err: reqwest::Error) -> StoreError {
    if err.is_connect() || err.is_timeout() {
        StoreError::Unreachable(err.to_string())
    } else if err.is_decode() {
        StoreError::Decode(err.to_string())
    } else {
        StoreError::Http(err.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    Err(StoreError::Remote {
        status: status.as_u16(),
        message,
    })
}

const fn pin_flag(pin: bool) -> &'static str {
    if pin { "true" } else { "false" }
}

/// Encode a topic as base64url multibase, as the pubsub API expects.
fn encode_multibase(data: &[u8]) -> String {
    multibase::encode(Base::Base64Url, data)
}

fn decode_multibase(encoded: &str) -> Result<Vec<u8>, StoreError> {
    multibase::decode(encoded)
        .map(|(_, bytes)| bytes)
        .map_err(|e| StoreError::Decode(format!("{encoded}: {e}")))
}

fn parse_message(line: &[u8]) -> Result<PubSubMessage, StoreError> {
    let raw: SubMessage = serde_json::from_slice(line)?;
    let seqno = if raw.seqno.is_empty() {
        0
    } else {
        decode_multibase(&raw.seqno)?
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    };
    let topics = raw
        .topic_ids
        .iter()
        .map(|t| decode_multibase(t).map(|b| String::from_utf8_lossy(&b).into_owned()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PubSubMessage {
        from: raw.from,
        data: Bytes::from(decode_multibase(&raw.data)?),
        seqno,
        topics,
    })
}

#[async_trait]
impl ContentStore for KuboStore {
    async fn is_reachable(&self) -> bool {
        let probe = self
            .client
            .post(self.url("version"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        match probe {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::trace!(api = %self.api_url, "daemon probe failed: {e}");
                false
            }
        }
    }

    async fn identity(&self) -> Result<PeerInfo, StoreError> {
        let id: IdResponse = self
            .call("id", &[], None)
            .await?
            .json()
            .await
            .map_err(http_error)?;
        Ok(PeerInfo {
            id: id.id,
            addresses: id.addresses.unwrap_or_default(),
        })
    }

    async fn add(&self, content: Bytes, pin: bool) -> Result<ContentId, StoreError> {
        let query = [
            ("pin", pin_flag(pin)),
            ("hash", MULTIHASH),
            ("cid-version", "1"),
        ];
        let added: AddResponse = self
            .call("add", &query, Some(content))
            .await?
            .json()
            .await
            .map_err(http_error)?;
        Ok(ContentId::new(added.hash))
    }

    async fn cat(&self, id: &ContentId) -> Result<Bytes, StoreError> {
        self.call("cat", &[("arg", id.as_str())], None)
            .await?
            .bytes()
            .await
            .map_err(http_error)
    }

    async fn dag_put(
        &self,
        data: Bytes,
        input: DagCodec,
        format: DagCodec,
        pin: bool,
    ) -> Result<ContentId, StoreError> {
        let query = [
            ("input-codec", input.as_str()),
            ("store-codec", format.as_str()),
            ("pin", pin_flag(pin)),
            ("hash", MULTIHASH),
        ];
        let put: DagPutResponse = self
            .call("dag/put", &query, Some(data))
            .await?
            .json()
            .await
            .map_err(http_error)?;
        Ok(ContentId::new(put.cid.cid))
    }

    async fn dag_get(&self, path: &str) -> Result<Value, StoreError> {
        let query = [("arg", path), ("output-codec", DagCodec::DagJson.as_str())];
        self.call("dag/get", &query, None)
            .await?
            .json()
            .await
            .map_err(http_error)
    }

    async fn publish(&self, topic: &str, message: Bytes) -> Result<(), StoreError> {
        let topic = encode_multibase(topic.as_bytes());
        self.call("pubsub/pub", &[("arg", topic.as_str())], Some(message))
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, StoreError> {
        let encoded = encode_multibase(topic.as_bytes());
        let response = self
            .call("pubsub/sub", &[("arg", encoded.as_str())], None)
            .await?;
        tracing::debug!(%topic, api = %self.api_url, "opened pubsub stream");
        Ok(Box::new(KuboSubscription {
            topic: topic.to_string(),
            response: Some(response),
            buf: Vec::new(),
        }))
    }
}

/// Subscription reading the daemon's newline-delimited JSON message stream.
pub struct KuboSubscription {
    topic: String,
    response: Option<Response>,
    buf: Vec<u8>,
}

impl KuboSubscription {
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=end).collect();
        line.pop();
        Some(line)
    }
}

#[async_trait]
impl Subscription for KuboSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next(&mut self) -> Result<PubSubMessage, StoreError> {
        loop {
            while let Some(line) = self.take_line() {
                if !line.iter().all(u8::is_ascii_whitespace) {
                    return parse_message(&line);
                }
            }
            let response = self.response.as_mut().ok_or(StoreError::SubscriptionClosed)?;
            match response.chunk().await.map_err(http_error)? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => {
                    self.response = None;
                    return Err(StoreError::SubscriptionClosed);
                }
            }
        }
    }

    async fn cancel(&mut self) -> Result<(), StoreError> {
        // Closing the stream ends the subscription on the daemon.
        self.response = None;
        self.buf.clear();
        Ok(())
    }
}
