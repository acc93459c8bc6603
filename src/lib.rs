//! # Duroflow: durable activity execution
//!
//! Duroflow runs trees of composable *activities* to completion while letting
//! the host pause, persist, resume, cancel and even restructure them.
//!
//! ## Key concepts
//!
//! - **Activities** ([`Activity`]) are immutable definitions. They declare
//!   arguments, variables and children in [`Activity::cache_metadata`] and do
//!   their work through an [`ActivityContext`].
//! - **Activity instances** are the live nodes of one execution. They are
//!   kept in an arena and addressed by [`InstanceId`].
//! - **Environments** hold argument and variable storage and form a chain
//!   that mirrors the instance tree.
//! - **Work items** are the atomic steps the cooperative scheduler runs, one
//!   at a time per workflow instance.
//! - **Bookmarks** let external events resume a waiting instance exactly
//!   once.
//! - **Snapshots** ([`runtime::WorkflowSnapshot`]) capture the whole instance
//!   at a persistable point and restore it against the same definition.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use duroflow::activities::{Sequence, WaitForBookmark};
//! use duroflow::providers::in_memory::InMemoryInstanceStore;
//! use duroflow::runtime::{RuntimeOptions, WorkflowApplication};
//! use duroflow::{Activity, WorkflowIdentity};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let workflow: Arc<dyn Activity> = Arc::new(
//!     Sequence::new("Approve").then(WaitForBookmark::new("WaitForManager", "approval")),
//! );
//! let store = Arc::new(InMemoryInstanceStore::default());
//! let app = WorkflowApplication::new(workflow, WorkflowIdentity::new("approve"), store, RuntimeOptions::default())?;
//!
//! app.run().await?;
//! app.wait_for_idle(std::time::Duration::from_secs(5)).await?;
//! app.resume_bookmark("approval", json!(true)).await?;
//! let status = app.wait_for_completion(std::time::Duration::from_secs(5)).await?;
//! println!("finished: {status:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`activity`] / [`definition`]: the activity contract and the compiled
//!   definition tree
//! - [`runtime`]: executor, scheduler, bookmarks, transactions, dynamic update
//!   and the tokio host
//! - [`providers`]: durable instance stores
//! - [`activities`]: a small catalog of built-in activities

use serde::{Deserialize, Serialize};

pub mod activities;
pub mod activity;
pub mod definition;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod providers;
pub mod runtime;

/// Values flowing through arguments, variables and bookmarks.
pub type Value = serde_json::Value;

pub use activity::{
    Activity, ActivityDelegate, ActivityMetadata, ArgumentBinding, ArgumentDirection, CompletedChild,
    FaultDisposition, HandleKind, RuntimeArgument, Variable,
};
pub use definition::ActivityTable;
pub use errors::{
    ActivityError, ActivityResult, BlockingActivity, CallbackError, ErrorDetails, FatalError, Fault,
    InstanceUpdateError, WorkflowError,
};
pub use ids::{ActivityId, EnvironmentId, InstanceId, OperationId};
pub use runtime::{ActivityContext, ActivityExecutor, ExecutorSettings};

/// Name and version of a workflow definition.
///
/// Persisted instances record the identity they were started with and only
/// load against a definition with the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowIdentity {
    pub name: String,
    #[serde(default)]
    pub version: Option<semver::Version>,
}

impl WorkflowIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: semver::Version) -> Self {
        self.version = Some(version);
        self
    }
}

impl std::fmt::Display for WorkflowIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}@{v}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_display_includes_version() {
        let id = WorkflowIdentity::new("order").with_version(semver::Version::new(1, 2, 0));
        assert_eq!(id.to_string(), "order@1.2.0");
        assert_eq!(WorkflowIdentity::new("order").to_string(), "order");
    }

    #[test]
    fn identity_versions_distinguish() {
        let a = WorkflowIdentity::new("order").with_version(semver::Version::new(1, 0, 0));
        let b = WorkflowIdentity::new("order").with_version(semver::Version::new(2, 0, 0));
        assert_ne!(a, b);
        let json = serde_json::to_string(&a).unwrap();
        let back: WorkflowIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }
}
