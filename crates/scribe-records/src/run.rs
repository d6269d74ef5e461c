//! Run records.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use scribe_backend::Node;
use scribe_core::{ContentId, ContentStore, DagCodec};
use serde::{Deserialize, Serialize};

use crate::{Project, RecordError};

/// Seed comment added to every new run.
const CREATED_COMMENT: &str = "run created.";

/// Run status, encoded as its numeric code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RunStatus {
    /// Run exists locally only.
    #[default]
    Created,
    /// Run is producing data.
    Active,
    /// Run has been stored on the network under its parent project.
    Synced,
    /// Run is finished and kept for reference.
    Archived,
}

impl RunStatus {
    /// Numeric status code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Created => 1,
            Self::Active => 2,
            Self::Synced => 3,
            Self::Archived => 4,
        }
    }

    #[allow(clippy::trivially_copy_pass_by_ref)]
    const fn is_created(&self) -> bool {
        matches!(self, Self::Created)
    }
}

impl From<RunStatus> for u8 {
    fn from(status: RunStatus) -> Self {
        status.code()
    }
}

/// Error returned when decoding an unknown status code.
#[derive(Debug, thiserror::Error)]
#[error("Unknown run status code: {0}")]
pub struct UnknownStatus(u8);

impl TryFrom<u8> for RunStatus {
    type Error = UnknownStatus;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Created),
            2 => Ok(Self::Active),
            3 => Ok(Self::Synced),
            4 => Ok(Self::Archived),
            other => Err(UnknownStatus(other)),
        }
    }
}

/// A timestamped history entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    timestamp: DateTime<Utc>,
    text: String,
}

impl Comment {
    /// When the comment was made.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The comment text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

fn is_empty_path(path: &Path) -> bool {
    path.as_os_str().is_empty()
}

/// A sequencing run belonging to a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    created: DateTime<Utc>,
    label: String,

    #[serde(default, skip_serializing_if = "RunStatus::is_created")]
    status: RunStatus,

    /// Append-only, ordered by timestamp.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    history: Vec<Comment>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    tags: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    request_order: Vec<String>,

    #[serde(default, skip_serializing_if = "is_empty_path")]
    output_directory: PathBuf,

    #[serde(default, skip_serializing_if = "is_empty_path")]
    fast5_output_directory: PathBuf,

    #[serde(default, skip_serializing_if = "is_empty_path")]
    fastq_output_directory: PathBuf,

    /// Id of the registered parent project; empty while orphaned.
    #[serde(default, skip_serializing_if = "ContentId::is_empty")]
    parent_project_cid: ContentId,
}

impl Run {
    /// Create a run with the seed history comment.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        fast5_dir: impl Into<PathBuf>,
        fastq_dir: impl Into<PathBuf>,
    ) -> Self {
        let created = Utc::now();
        Self {
            created,
            label: label.into(),
            status: RunStatus::Created,
            history: vec![Comment {
                timestamp: created,
                text: CREATED_COMMENT.to_string(),
            }],
            tags: BTreeSet::new(),
            request_order: Vec::new(),
            output_directory: output_dir.into(),
            fast5_output_directory: fast5_dir.into(),
            fastq_output_directory: fastq_dir.into(),
            parent_project_cid: ContentId::default(),
        }
    }

    /// Load a synced run.
    ///
    /// # Errors
    /// Returns [`RecordError::MissingId`] for an empty id, or the node's
    /// error.
    pub async fn fetch<S: ContentStore>(
        node: &Node<S>,
        cid: &ContentId,
    ) -> Result<Self, RecordError> {
        if cid.is_empty() {
            return Err(RecordError::MissingId);
        }
        Ok(node.dag_get(cid, "").await?)
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub const fn created(&self) -> DateTime<Utc> {
        self.created
    }

    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    pub const fn set_status(&mut self, status: RunStatus) {
        self.status = status;
    }

    #[must_use]
    pub fn history(&self) -> &[Comment] {
        &self.history
    }

    #[must_use]
    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }

    #[must_use]
    pub fn fast5_output_directory(&self) -> &Path {
        &self.fast5_output_directory
    }

    #[must_use]
    pub fn fastq_output_directory(&self) -> &Path {
        &self.fastq_output_directory
    }

    /// Append a comment to the history.
    ///
    /// The timestamp never precedes the run's creation or the previous
    /// comment, even if the wall clock steps backwards.
    ///
    /// # Errors
    /// Returns [`RecordError::EmptyComment`] for empty text; nothing is
    /// appended.
    pub fn add_comment(&mut self, text: impl Into<String>) -> Result<(), RecordError> {
        let text = text.into();
        if text.is_empty() {
            return Err(RecordError::EmptyComment);
        }
        let floor = self
            .history
            .last()
            .map_or(self.created, |last| last.timestamp.max(self.created));
        self.history.push(Comment {
            timestamp: Utc::now().max(floor),
            text,
        });
        Ok(())
    }

    /// Add a tag. Returns false if it was already present.
    pub fn add_tag(&mut self, tag: impl Into<String>) -> bool {
        self.tags.insert(tag.into())
    }

    /// Remove a tag. Returns false if it was not present.
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        self.tags.remove(tag)
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    /// Append an identifier to the request order.
    pub fn push_request(&mut self, id: impl Into<String>) {
        self.request_order.push(id.into());
    }

    #[must_use]
    pub fn request_order(&self) -> &[String] {
        &self.request_order
    }

    /// Id of the parent project, if the run has one.
    #[must_use]
    pub fn parent_project_cid(&self) -> Option<&ContentId> {
        Some(&self.parent_project_cid).filter(|cid| !cid.is_empty())
    }

    /// Make `project` the parent of this run.
    ///
    /// # Errors
    /// Returns [`RecordError::UnregisteredProject`] if the project has no id.
    pub fn set_parent(&mut self, project: &Project) -> Result<(), RecordError> {
        let cid = project
            .cid()
            .ok_or_else(|| RecordError::UnregisteredProject(project.label().to_string()))?;
        self.parent_project_cid = cid.clone();
        Ok(())
    }

    /// Store the run on the network and link it from its parent project.
    ///
    /// The run is marked [`RunStatus::Synced`] and stored; `parent` then
    /// references the run's id under the run label. Push the owning
    /// database afterwards to persist the updated parent.
    ///
    /// # Errors
    /// Returns [`RecordError::OrphanRecord`] without a parent,
    /// [`RecordError::ParentMismatch`] if `parent` is not the run's parent,
    /// or the node's error. The run and parent are unchanged on failure.
    pub async fn sync<S: ContentStore>(
        &mut self,
        node: &Node<S>,
        parent: &mut Project,
        pin: bool,
    ) -> Result<ContentId, RecordError> {
        let Some(expected) = self.parent_project_cid().cloned() else {
            return Err(RecordError::OrphanRecord(self.label.clone()));
        };
        if parent.cid() != Some(&expected) {
            return Err(RecordError::ParentMismatch {
                run: self.label.clone(),
                expected,
                found: parent.label().to_string(),
            });
        }

        let synced = Self {
            status: RunStatus::Synced,
            ..self.clone()
        };
        let data = serde_json::to_vec(&synced)?;
        let cid = node
            .dag_put(data, DagCodec::DagJson, DagCodec::DagCbor, pin)
            .await?;

        *self = synced;
        parent.link_run(&self.label, cid.clone());
        tracing::info!(run = %self.label, project = %parent.label(), %cid, "synced run");
        Ok(cid)
    }
}

#[cfg(test)]
mod tests {
    use scribe_backend::{NodeError, storage::MemoryStore};
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn test_run() -> Run {
        Run::new("test label", "test output directory", "fast5s", "fastqs")
    }

    async fn registered_project(node: &Node<MemoryStore>) -> Project {
        let mut project = Project::new("test project");
        project.register(node, true).await.unwrap();
        project
    }

    #[test]
    fn test_new_run() {
        let run = test_run();
        assert_eq!(run.label(), "test label");
        assert_eq!(run.status(), RunStatus::Created);
        assert_eq!(run.status().code(), 1);
        assert_eq!(run.tags().count(), 0);
        assert!(run.request_order().is_empty());
        assert_eq!(run.history().len(), 1);
        assert_eq!(run.history()[0].text(), "run created.");
        assert_eq!(run.fast5_output_directory(), Path::new("fast5s"));
        assert!(run.parent_project_cid().is_none());
    }

    #[test]
    fn test_add_comment() {
        let mut run = test_run();
        assert!(matches!(run.add_comment(""), Err(RecordError::EmptyComment)));
        assert_eq!(run.history().len(), 1);

        // Whitespace is still text.
        assert_ok!(run.add_comment("   "));
        assert_eq!(run.history()[1].text(), "   ");

        assert_ok!(run.add_comment("x"));
        assert_eq!(run.history().len(), 3);
        let comment = &run.history()[2];
        assert_eq!(comment.text(), "x");
        assert!(comment.timestamp() >= run.created());
        assert!(comment.timestamp() >= run.history()[0].timestamp());
    }

    #[test]
    fn test_status_encoded_as_code() {
        let mut run = test_run();
        let json = serde_json::to_value(&run).unwrap();
        assert!(json.get("status").is_none());

        run.set_status(RunStatus::Synced);
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], 3);
        let decoded: Run = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(decoded.status(), RunStatus::Synced);

        let mut bad = json;
        bad["status"] = 9.into();
        assert_err!(serde_json::from_value::<Run>(bad));
    }

    #[test]
    fn test_tags_and_requests() {
        let mut run = test_run();
        assert!(run.add_tag("barcoded"));
        assert!(!run.add_tag("barcoded"));
        assert!(run.has_tag("barcoded"));
        assert!(run.remove_tag("barcoded"));
        assert!(!run.has_tag("barcoded"));

        run.push_request("b");
        run.push_request("a");
        assert_eq!(run.request_order(), ["b", "a"]);
    }

    #[test]
    fn test_set_parent_requires_registration() {
        let mut run = test_run();
        assert!(matches!(
            run.set_parent(&Project::new("alpha")),
            Err(RecordError::UnregisteredProject(_))
        ));
    }

    #[tokio::test]
    async fn test_orphan_run_cannot_sync() {
        let node = Node::init(MemoryStore::new()).await.unwrap();
        let mut project = registered_project(&node).await;
        let mut run = test_run();

        let err = run.sync(&node, &mut project, true).await.unwrap_err();
        assert!(matches!(err, RecordError::OrphanRecord(label) if label == "test label"));
        assert_eq!(run.status(), RunStatus::Created);
        assert_eq!(project.runs().count(), 0);
    }

    #[tokio::test]
    async fn test_sync_links_parent() {
        let node = Node::init(MemoryStore::new()).await.unwrap();
        let mut project = registered_project(&node).await;
        let mut run = test_run();
        run.set_parent(&project).unwrap();
        run.add_comment("basecalling started").unwrap();

        let cid = run.sync(&node, &mut project, true).await.unwrap();
        assert_eq!(run.status(), RunStatus::Synced);
        assert_eq!(project.run_cid("test label"), Some(&cid));
        assert!(node.store().is_pinned(&cid));

        let fetched = project.fetch_run(&node, "test label").await.unwrap();
        assert_eq!(fetched, run);
        assert_eq!(fetched.history().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_rejects_other_project() {
        let node = Node::init(MemoryStore::new()).await.unwrap();
        let parent = registered_project(&node).await;
        let mut other = Project::new("other project");
        other.register(&node, true).await.unwrap();

        let mut run = test_run();
        run.set_parent(&parent).unwrap();
        assert!(matches!(
            run.sync(&node, &mut other, true).await,
            Err(RecordError::ParentMismatch { .. })
        ));
        assert_eq!(other.runs().count(), 0);
    }

    #[tokio::test]
    async fn test_sync_offline_leaves_run_unchanged() {
        let node = Node::init(MemoryStore::new()).await.unwrap();
        let mut project = registered_project(&node).await;
        let mut run = test_run();
        run.set_parent(&project).unwrap();

        node.disconnect();
        assert!(matches!(
            run.sync(&node, &mut project, true).await,
            Err(RecordError::Node(NodeError::Offline))
        ));
        assert_eq!(run.status(), RunStatus::Created);
        assert_eq!(project.runs().count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_missing_id() {
        let node = Node::init(MemoryStore::new()).await.unwrap();
        assert!(matches!(
            Run::fetch(&node, &ContentId::default()).await,
            Err(RecordError::MissingId)
        ));
    }
}
