//! Serializable image of a workflow instance.
//!
//! A snapshot is only taken at a persistable point: no transaction, no
//! outstanding asynchronous work and no open no-persist zone (except the
//! transactional save that happens right before commit, which is patched to
//! look committed). Workflow thread properties and tracking participants are
//! not part of it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use uuid::Uuid;

use crate::errors::Fault;
use crate::ids::InstanceId;
use crate::runtime::bookmarks::{BookmarkManager, BookmarkScopeManager};
use crate::runtime::environment::EnvironmentArena;
use crate::runtime::executor::{PersistenceWaiter, TransactionContextWaiter};
use crate::runtime::instance::{ActivityInstanceState, InstanceMap};
use crate::runtime::scheduler::Scheduler;
use crate::{Value, WorkflowIdentity};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub format_version: u32,
    pub instance_id: Uuid,
    pub identity: WorkflowIdentity,
    /// Structural hash of the definition the snapshot was taken with
    pub definition_hash: String,
    pub saved_at_ms: u64,

    pub scheduler: Scheduler,
    pub instances: InstanceMap,
    pub environments: EnvironmentArena,
    pub bookmarks: BookmarkManager,
    pub bookmark_scopes: BookmarkScopeManager,

    pub root: Option<InstanceId>,
    pub secondary_roots: BTreeSet<InstanceId>,
    pub root_state: Option<ActivityInstanceState>,
    pub execution_state: Option<ActivityInstanceState>,
    #[serde(default)]
    pub workflow_outputs: BTreeMap<String, Value>,
    pub completion_exception: Option<Fault>,
    pub main_body_complete_raised: bool,
    pub next_tracking_record_number: u64,

    pub no_persist_count: u32,
    #[serde(default)]
    pub persistence_waiters: VecDeque<PersistenceWaiter>,
    #[serde(default)]
    pub transaction_context_waiters: VecDeque<TransactionContextWaiter>,
    pub is_root_cancel_pending: bool,
    #[serde(default)]
    pub root_argument_overrides: BTreeMap<String, Value>,
    pub next_operation_id: u64,
}

impl WorkflowSnapshot {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Whether every root had finished when the snapshot was taken.
    pub fn is_completed(&self) -> bool {
        self.execution_state.is_some()
    }

    pub fn live_instance_count(&self) -> usize {
        self.instances.live().count()
    }
}
