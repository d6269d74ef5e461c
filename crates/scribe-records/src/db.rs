//! Project database synchronized through the content store.

use std::collections::BTreeMap;

use scribe_backend::{Node, NodeError};
use scribe_core::{ContentId, ContentStore, DagCodec, ScribeConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Project;

/// Record error.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Project not found: {0}")]
    NotFound(String),
    #[error("Run not found: {0}")]
    RunNotFound(String),
    #[error("Project already in the database (label: {0})")]
    DuplicateLabel(String),
    #[error("Project database is not empty, pull does not support merges")]
    NonEmptyTarget,
    #[error("No content id provided")]
    MissingId,
    #[error("Orphan run can't be synced, needs a parent project (label: {0})")]
    OrphanRecord(String),
    #[error("Project is not registered on the network (label: {0})")]
    UnregisteredProject(String),
    #[error("Run {run} belongs to project {expected}, not {found}")]
    ParentMismatch {
        run: String,
        expected: ContentId,
        found: String,
    },
    #[error("No comment provided")]
    EmptyComment,
    #[error("Node error: {0}")]
    Node(#[from] NodeError),
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

const fn default_pin() -> bool {
    true
}

/// In-memory collection of projects, keyed by unique label.
///
/// Pushed and pulled as a single DAG object. Maps are ordered and empty
/// fields are omitted, so unchanged content always gets the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDatabase {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    projects: BTreeMap<String, Project>,

    /// Local retention preference; not part of the pushed content.
    #[serde(skip, default = "default_pin")]
    pin: bool,
}

impl Default for ProjectDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectDatabase {
    /// Create an empty database that pins what it pushes.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            projects: BTreeMap::new(),
            pin: true,
        }
    }

    /// Create an empty database following the configured pinning.
    #[must_use]
    pub const fn with_config(config: &ScribeConfig) -> Self {
        Self {
            projects: BTreeMap::new(),
            pin: config.pinning,
        }
    }

    /// Whether pushed content is pinned.
    #[must_use]
    pub const fn pin(&self) -> bool {
        self.pin
    }

    /// Set whether pushed content is pinned.
    pub const fn set_pin(&mut self, pin: bool) {
        self.pin = pin;
    }

    /// Number of projects in the database.
    #[must_use]
    pub fn num_projects(&self) -> usize {
        self.projects.len()
    }

    /// True if the database holds no projects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Project labels in sorted order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.projects.keys().map(String::as_str)
    }

    /// Add a project.
    ///
    /// # Errors
    /// Returns [`RecordError::DuplicateLabel`] if the label is taken; the
    /// existing project is left untouched.
    pub fn add_project(&mut self, project: Project) -> Result<(), RecordError> {
        if self.projects.contains_key(project.label()) {
            return Err(RecordError::DuplicateLabel(project.label().to_string()));
        }
        self.projects.insert(project.label().to_string(), project);
        Ok(())
    }

    /// Get a project by label.
    ///
    /// # Errors
    /// Returns [`RecordError::NotFound`] if no project has the label.
    pub fn get_project(&self, label: &str) -> Result<&Project, RecordError> {
        self.projects
            .get(label)
            .ok_or_else(|| RecordError::NotFound(label.to_string()))
    }

    /// Get a project by label for modification.
    ///
    /// # Errors
    /// Returns [`RecordError::NotFound`] if no project has the label.
    pub fn get_project_mut(&mut self, label: &str) -> Result<&mut Project, RecordError> {
        self.projects
            .get_mut(label)
            .ok_or_else(|| RecordError::NotFound(label.to_string()))
    }

    /// Push the database to the content store and return its id.
    ///
    /// Pushing unchanged content again yields the same id.
    ///
    /// # Errors
    /// Returns error if encoding fails or the node rejects the write.
    pub async fn push<S: ContentStore>(&self, node: &Node<S>) -> Result<ContentId, RecordError> {
        let data = serde_json::to_vec(self)?;
        let cid = node
            .dag_put(data, DagCodec::DagJson, DagCodec::DagCbor, self.pin)
            .await?;
        tracing::info!(%cid, projects = self.projects.len(), pin = self.pin, "pushed project database");
        Ok(cid)
    }

    /// Pull a database from the content store into this empty one.
    ///
    /// # Errors
    /// Returns [`RecordError::NonEmptyTarget`] if this database holds any
    /// project, [`RecordError::MissingId`] for an empty id, or the node's
    /// error. The database is unchanged on failure.
    pub async fn pull<S: ContentStore>(
        &mut self,
        node: &Node<S>,
        cid: &ContentId,
    ) -> Result<(), RecordError> {
        if !self.projects.is_empty() {
            return Err(RecordError::NonEmptyTarget);
        }
        if cid.is_empty() {
            return Err(RecordError::MissingId);
        }

        let pulled: Self = node.dag_get(cid, "").await?;
        let mut projects = BTreeMap::new();
        for project in pulled.projects.into_values() {
            let label = project.label().to_string();
            if projects.insert(label.clone(), project).is_some() {
                return Err(RecordError::DuplicateLabel(label));
            }
        }
        self.projects = projects;
        tracing::info!(%cid, projects = self.projects.len(), "pulled project database");
        Ok(())
    }
}
