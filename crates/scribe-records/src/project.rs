//! Project records.

use std::collections::BTreeMap;

use scribe_backend::Node;
use scribe_core::{ContentId, ContentStore, DagCodec};
use serde::{Deserialize, Serialize};

use crate::{RecordError, Run};

/// A project, identified by its label.
///
/// A project carries no synchronization state until it is registered,
/// which gives it a content id that runs can reference as their parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    label: String,

    /// Id assigned by [`Project::register`].
    #[serde(default, skip_serializing_if = "ContentId::is_empty")]
    cid: ContentId,

    /// Synced runs, by label.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    runs: BTreeMap<String, ContentId>,
}

impl Project {
    /// Create a project with only its label set.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// The project label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The id the project was registered under, if registered.
    #[must_use]
    pub fn cid(&self) -> Option<&ContentId> {
        Some(&self.cid).filter(|cid| !cid.is_empty())
    }

    /// True once the project has been registered.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.cid().is_some()
    }

    /// Synced runs as `(label, id)` pairs in label order.
    pub fn runs(&self) -> impl Iterator<Item = (&str, &ContentId)> {
        self.runs.iter().map(|(label, cid)| (label.as_str(), cid))
    }

    /// Id of the synced run with `label`.
    #[must_use]
    pub fn run_cid(&self, label: &str) -> Option<&ContentId> {
        self.runs.get(label)
    }

    pub(crate) fn link_run(&mut self, label: &str, cid: ContentId) {
        self.runs.insert(label.to_string(), cid);
    }

    /// Register the project on the network.
    ///
    /// Stores this project record on its own and keeps the resulting id as
    /// the project's id. Registering unchanged content again yields the
    /// same id. The owning database still has to be pushed to persist it.
    ///
    /// # Errors
    /// Returns error if encoding fails or the node rejects the write.
    pub async fn register<S: ContentStore>(
        &mut self,
        node: &Node<S>,
        pin: bool,
    ) -> Result<ContentId, RecordError> {
        let record = Self {
            cid: ContentId::default(),
            ..self.clone()
        };
        let data = serde_json::to_vec(&record)?;
        let cid = node
            .dag_put(data, DagCodec::DagJson, DagCodec::DagCbor, pin)
            .await?;
        tracing::info!(label = %self.label, %cid, "registered project");
        self.cid = cid.clone();
        Ok(cid)
    }

    /// Load a synced run of this project.
    ///
    /// # Errors
    /// Returns [`RecordError::RunNotFound`] if no run with `label` was
    /// synced to this project, or the node's error.
    pub async fn fetch_run<S: ContentStore>(
        &self,
        node: &Node<S>,
        label: &str,
    ) -> Result<Run, RecordError> {
        let cid = self
            .run_cid(label)
            .ok_or_else(|| RecordError::RunNotFound(label.to_string()))?;
        Run::fetch(node, cid).await
    }
}

#[cfg(test)]
mod tests {
    use scribe_backend::storage::MemoryStore;

    use super::*;

    #[test]
    fn test_new_project_is_unregistered() {
        let project = Project::new("alpha");
        assert_eq!(project.label(), "alpha");
        assert!(!project.is_registered());
        assert_eq!(project.runs().count(), 0);
    }

    #[tokio::test]
    async fn test_register_assigns_stable_id() {
        let node = Node::init(MemoryStore::new()).await.unwrap();
        let mut project = Project::new("alpha");

        let first = project.register(&node, true).await.unwrap();
        assert_eq!(project.cid(), Some(&first));
        assert!(node.store().is_pinned(&first));

        // The id field is not part of the registered content.
        let second = project.register(&node, true).await.unwrap();
        assert_eq!(first, second);

        let stored: Project = node.dag_get(&first, "").await.unwrap();
        assert_eq!(stored.label(), "alpha");
        assert!(!stored.is_registered());
    }

    #[tokio::test]
    async fn test_fetch_unknown_run() {
        let node = Node::init(MemoryStore::new()).await.unwrap();
        let project = Project::new("alpha");
        assert!(matches!(
            project.fetch_run(&node, "run-1").await,
            Err(RecordError::RunNotFound(label)) if label == "run-1"
        ));
    }
}
