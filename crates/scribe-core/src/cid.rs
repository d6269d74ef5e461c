//! Content identifiers and DAG codecs.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Identifier of a stored blob or DAG object.
///
/// Derived by the store from the hash of the stored content, so identical
/// content always yields the same id. The string form is opaque to scribe.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Wrap an id string returned by a store.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty id, which never addresses content.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a store path addressing `field` inside the object.
    ///
    /// An empty `field` addresses the whole object.
    #[must_use]
    pub fn path(&self, field: &str) -> String {
        let field = field.trim_matches('/');
        if field.is_empty() {
            self.0.clone()
        } else {
            format!("{}/{field}", self.0)
        }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ContentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ContentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// IPLD codec used to encode or store a DAG object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DagCodec {
    /// JSON with IPLD link conventions.
    DagJson,
    /// Deterministic CBOR.
    DagCbor,
    /// Opaque bytes.
    Raw,
}

impl DagCodec {
    /// Codec name as understood by the daemon RPC API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DagJson => "dag-json",
            Self::DagCbor => "dag-cbor",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for DagCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown codec name.
#[derive(Debug, thiserror::Error)]
#[error("Unknown DAG codec: {0}")]
pub struct UnknownCodec(String);

impl FromStr for DagCodec {
    type Err = UnknownCodec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dag-json" | "json" => Ok(Self::DagJson),
            "dag-cbor" | "cbor" => Ok(Self::DagCbor),
            "raw" => Ok(Self::Raw),
            other => Err(UnknownCodec(other.to_string())),
        }
    }
}
