//! Snapshot capture and restore.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{ActivityExecutor, ExecutorSettings};
use crate::WorkflowIdentity;
use crate::activity::Activity;
use crate::definition::ActivityTable;
use crate::errors::WorkflowError;
use crate::runtime::host::WorkflowHost;
use crate::runtime::snapshot::{SNAPSHOT_FORMAT_VERSION, WorkflowSnapshot};
use crate::runtime::work_item::WorkItem;

/// Adjustments applied to a snapshot taken inside a transaction so that it
/// describes the state right after the commit.
#[derive(Debug, Default)]
pub(crate) struct SnapshotPatch {
    pub(crate) extra_work: Vec<WorkItem>,
    pub(crate) released_no_persist: u32,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ActivityExecutor {
    pub(crate) fn build_snapshot(&self, patch: Option<SnapshotPatch>) -> WorkflowSnapshot {
        let mut snapshot = WorkflowSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            instance_id: self.instance_id,
            identity: self.identity.clone(),
            definition_hash: self.definition.definition_hash().to_string(),
            saved_at_ms: now_ms(),
            scheduler: self.scheduler.clone(),
            instances: self.instances.clone(),
            environments: self.environments.clone(),
            bookmarks: self.bookmarks.clone(),
            bookmark_scopes: self.scopes.clone(),
            root: self.root,
            secondary_roots: self.secondary_roots.clone(),
            root_state: self.root_state,
            execution_state: self.execution_state,
            workflow_outputs: self.workflow_outputs.clone(),
            completion_exception: self.completion_exception.clone(),
            main_body_complete_raised: self.main_body_complete_raised,
            next_tracking_record_number: self.next_tracking_record_number,
            no_persist_count: self.no_persist_count,
            persistence_waiters: self.persistence_waiters.clone(),
            transaction_context_waiters: self.transaction_context_waiters.clone(),
            is_root_cancel_pending: self.is_root_cancel_pending,
            root_argument_overrides: self.root_argument_overrides.clone(),
            next_operation_id: self.next_operation_id,
        };
        if let Some(patch) = patch {
            for item in patch.extra_work {
                snapshot.scheduler.push_work(item);
            }
            snapshot.no_persist_count = snapshot.no_persist_count.saturating_sub(patch.released_no_persist);
        }
        snapshot
    }

    /// Capture the instance for durable storage. Only valid at a persistable
    /// point.
    pub fn snapshot(&self) -> Result<WorkflowSnapshot, WorkflowError> {
        if !self.is_persistable() {
            return Err(WorkflowError::invalid_operation(format!(
                "workflow {} is not at a persistable point",
                self.instance_id
            )));
        }
        Ok(self.build_snapshot(None))
    }

    /// Rebuild an executor from a snapshot. The definition must be the one the
    /// snapshot was taken with.
    pub fn restore(
        snapshot: WorkflowSnapshot,
        root: Arc<dyn Activity>,
        identity: WorkflowIdentity,
        host: Arc<dyn WorkflowHost>,
        settings: ExecutorSettings,
    ) -> Result<Self, WorkflowError> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(WorkflowError::VersionMismatch {
                expected: SNAPSHOT_FORMAT_VERSION.to_string(),
                found: snapshot.format_version.to_string(),
            });
        }
        if snapshot.identity != identity {
            return Err(WorkflowError::VersionMismatch {
                expected: identity.to_string(),
                found: snapshot.identity.to_string(),
            });
        }
        let definition = Arc::new(ActivityTable::build(root)?);
        if definition.definition_hash() != snapshot.definition_hash {
            return Err(WorkflowError::VersionMismatch {
                expected: definition.definition_hash().to_string(),
                found: snapshot.definition_hash,
            });
        }
        snapshot.environments.validate_links()?;
        for instance in snapshot.instances.iter() {
            definition.node(instance.activity)?;
            if let Some(env) = instance.environment
                && !snapshot.environments.contains(env)
            {
                return Err(WorkflowError::invalid_operation(format!(
                    "instance {} references missing environment {env}",
                    instance.id
                )));
            }
        }
        for env in snapshot.environments.iter() {
            definition.node(env.definition)?;
        }

        let mut executor = Self::from_parts(snapshot.instance_id, identity, definition, host, settings);
        executor.scheduler = snapshot.scheduler;
        executor.instances = snapshot.instances;
        executor.environments = snapshot.environments;
        executor.bookmarks = snapshot.bookmarks;
        executor.scopes = snapshot.bookmark_scopes;
        executor.root = snapshot.root;
        executor.secondary_roots = snapshot.secondary_roots;
        executor.root_state = snapshot.root_state;
        executor.execution_state = snapshot.execution_state;
        executor.workflow_outputs = snapshot.workflow_outputs;
        executor.completion_exception = snapshot.completion_exception;
        executor.main_body_complete_raised = snapshot.main_body_complete_raised;
        executor.next_tracking_record_number = snapshot.next_tracking_record_number;
        executor.no_persist_count = snapshot.no_persist_count;
        executor.persistence_waiters = snapshot.persistence_waiters;
        executor.transaction_context_waiters = snapshot.transaction_context_waiters;
        executor.is_root_cancel_pending = snapshot.is_root_cancel_pending;
        executor.root_argument_overrides = snapshot.root_argument_overrides;
        executor.next_operation_id = snapshot.next_operation_id;

        let environments: Vec<_> = executor.environments.iter().map(|e| e.id).collect();
        for env in environments {
            executor.register_mappables(env);
        }
        tracing::debug!(
            target: "duroflow::runtime",
            instance_id = %executor.instance_id,
            instances = executor.instances.len(),
            pending_work = executor.scheduler.pending_count(),
            "workflow restored"
        );
        Ok(executor)
    }
}
