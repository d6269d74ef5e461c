//! Explicit configuration for scribe nodes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default daemon RPC API address.
pub const DEFAULT_API_ADDRESS: &str = "127.0.0.1:5001";

/// Default storage quota for the daemon repository.
pub const DEFAULT_STORAGE_MAX: &str = "1GB";

/// Default project to operate on.
pub const DEFAULT_PROJECT: &str = "scribe-test-project";

/// Configuration consumed by the core.
///
/// Passed by value into constructors; there is no global configuration.
/// Reading and writing this from disk belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScribeConfig {
    /// Address of the daemon RPC API (`host:port`).
    pub api_address: String,

    /// Path to the daemon repository on this node.
    pub ipfs_path: PathBuf,

    /// Maximum storage available to the daemon repository.
    pub storage_max: String,

    /// Pin pushed content against garbage collection.
    pub pinning: bool,

    /// Project (and pubsub topic) to operate on.
    pub project: String,

    /// Content id of the remote project database, if one was pushed before.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_cid: Option<String>,

    /// Run in private mode.
    pub private: bool,
}

impl Default for ScribeConfig {
    fn default() -> Self {
        let ipfs_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ipfs");
        Self {
            api_address: DEFAULT_API_ADDRESS.to_string(),
            ipfs_path,
            storage_max: DEFAULT_STORAGE_MAX.to_string(),
            pinning: false,
            project: DEFAULT_PROJECT.to_string(),
            remote_cid: None,
            private: false,
        }
    }
}

impl ScribeConfig {
    /// Base URL of the daemon RPC API.
    #[must_use]
    pub fn api_url(&self) -> String {
        if self.api_address.starts_with("http://") || self.api_address.starts_with("https://") {
            format!("{}/api/v0", self.api_address.trim_end_matches('/'))
        } else {
            format!("http://{}/api/v0", self.api_address)
        }
    }

    /// Remote database id, ignoring an empty value.
    #[must_use]
    pub fn remote_cid(&self) -> Option<&str> {
        self.remote_cid.as_deref().filter(|cid| !cid.is_empty())
    }

    /// Set the project to operate on.
    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }
}
