//! Project records and the content-addressed project database.
//!
//! Provides:
//! - `ProjectDatabase` - label-keyed project store, pushed to and pulled from
//!   the content store as one DAG object
//! - `Project`, `Run`, `Comment` - record values held by the database
//!
//! The database has no internal locking; callers serialize mutation.

pub mod db;
pub mod project;
pub mod run;

pub use db::{ProjectDatabase, RecordError};
pub use project::Project;
pub use run::{Comment, Run, RunStatus, UnknownStatus};
