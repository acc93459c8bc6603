//! The orchestrator that owns one workflow instance's runtime state.
//!
//! An [`ActivityExecutor`] holds the instance tree, environments, bookmarks,
//! the work-item queue and the ambient transaction. It never blocks: whenever
//! it needs the host (persistence, transaction outcome, asynchronous work) it
//! records a [`HostRequest`], yields, and waits for the host to report back
//! through `complete_*`. Hosts call [`ActivityExecutor::run`] again after
//! every completion or external resumption.

mod lifecycle;
mod persistence;
mod transactions;
mod update;
mod work_items;

pub(crate) use lifecycle::ChildOptions;
use update::PendingUpdate;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tokio::sync::mpsc::UnboundedReceiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::activity::{Activity, ArgumentDirection};
use crate::definition::ActivityTable;
use crate::errors::{ErrorDetails, Fault, WorkflowError};
use crate::ids::{EnvironmentId, InstanceId, OperationId};
use crate::runtime::async_operation::{AsyncOperationContext, AsyncWork};
use crate::runtime::bookmarks::{
    Bookmark, BookmarkManager, BookmarkResumptionResult, BookmarkScopeManager,
};
use crate::runtime::environment::EnvironmentArena;
use crate::runtime::host::WorkflowHost;
use crate::runtime::instance::{ActivityInstanceState, InstanceMap};
use crate::runtime::location::LocationRef;
use crate::runtime::observability::MetricsProvider;
use crate::runtime::properties::ExecutionProperties;
use crate::runtime::scheduler::{
    self, IdleDecision, RequestedAction, Scheduler, SchedulerCallbacks, SchedulerOutcome,
};
use crate::runtime::snapshot::WorkflowSnapshot;
use crate::runtime::tracking::{
    ActivityRef, TrackingParticipant, TrackingRecord, WorkflowInstanceEvent,
};
use crate::runtime::transaction::{RuntimeTransactionSlot, Transaction, TransactionMessage};
use crate::runtime::work_item::{WorkItem, WorkItemKind};
use crate::runtime::lock;
use crate::{Value, WorkflowIdentity};

/// Tunables the host hands to each executor.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// How long to wait for the outcome of a transaction the engine cannot
    /// commit itself. Expiry rolls the transaction back.
    pub transaction_completion_timeout: Duration,
    /// Persist pending persistence requests inside the transaction before
    /// committing it
    pub persist_before_commit: bool,
    /// Whether activity-level log macros emit
    pub activity_logging: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            transaction_completion_timeout: Duration::from_secs(30),
            persist_before_commit: true,
            activity_logging: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceWaiter {
    pub instance: InstanceId,
    pub callback: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionContextWaiter {
    pub instance: InstanceId,
    pub callback: String,
    /// A requires-waiter holds a no-persist zone while it waits
    pub requires: bool,
}

/// Something the executor needs the host to do before it can continue.
pub enum HostRequest {
    /// Save `snapshot`; report back with
    /// [`ActivityExecutor::complete_host_operation`]. When `transaction` is
    /// set the save must only become visible if it commits.
    Persist {
        operation: OperationId,
        snapshot: Box<WorkflowSnapshot>,
        transaction: Option<Arc<dyn Transaction>>,
        associate_keys: Vec<Uuid>,
        disassociate_keys: Vec<Uuid>,
    },
    /// Wait up to `timeout` for the transaction outcome; report back with
    /// [`ActivityExecutor::complete_transaction_outcome`].
    AwaitTransactionOutcome {
        operation: OperationId,
        receiver: UnboundedReceiver<TransactionMessage>,
        timeout: Duration,
    },
    /// Run `work`; report back with [`ActivityExecutor::complete_async_operation`].
    RunAsync { operation: OperationId, work: AsyncWork },
}

impl HostRequest {
    pub fn operation(&self) -> OperationId {
        match self {
            HostRequest::Persist { operation, .. }
            | HostRequest::AwaitTransactionOutcome { operation, .. }
            | HostRequest::RunAsync { operation, .. } => *operation,
        }
    }
}

impl std::fmt::Debug for HostRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostRequest::Persist {
                operation,
                transaction,
                associate_keys,
                disassociate_keys,
                ..
            } => f
                .debug_struct("Persist")
                .field("operation", operation)
                .field("transactional", &transaction.is_some())
                .field("associate_keys", associate_keys)
                .field("disassociate_keys", disassociate_keys)
                .finish(),
            HostRequest::AwaitTransactionOutcome { operation, timeout, .. } => f
                .debug_struct("AwaitTransactionOutcome")
                .field("operation", operation)
                .field("timeout", timeout)
                .finish(),
            HostRequest::RunAsync { operation, .. } => {
                f.debug_struct("RunAsync").field("operation", operation).finish()
            }
        }
    }
}

/// Which host operation a parked work item waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InFlightStage {
    Persist,
    PersistBeforeCommit,
    AwaitTransactionOutcome,
}

#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) operation: OperationId,
    pub(crate) stage: InFlightStage,
    pub(crate) item: WorkItem,
}

/// A mappable location exposed for host inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct MappableLocation {
    pub name: String,
    pub location: LocationRef,
    pub owner: InstanceId,
    pub value: Value,
}

pub struct ActivityExecutor {
    pub(crate) instance_id: Uuid,
    pub(crate) identity: WorkflowIdentity,
    pub(crate) definition: Arc<ActivityTable>,
    pub(crate) host: Arc<dyn WorkflowHost>,
    pub(crate) settings: ExecutorSettings,
    pub(crate) metrics: Option<Arc<MetricsProvider>>,
    participants: Vec<Arc<dyn TrackingParticipant>>,

    pub(crate) scheduler: Scheduler,
    pub(crate) instances: InstanceMap,
    pub(crate) environments: EnvironmentArena,
    pub(crate) bookmarks: BookmarkManager,
    pub(crate) scopes: BookmarkScopeManager,
    pub(crate) mappable: BTreeMap<LocationRef, String>,

    pub(crate) root: Option<InstanceId>,
    pub(crate) secondary_roots: BTreeSet<InstanceId>,
    pub(crate) root_state: Option<ActivityInstanceState>,
    pub(crate) execution_state: Option<ActivityInstanceState>,
    pub(crate) workflow_outputs: BTreeMap<String, Value>,
    pub(crate) completion_exception: Option<Fault>,
    pub(crate) main_body_complete_raised: bool,
    pub(crate) next_tracking_record_number: u64,

    pub(crate) no_persist_count: u32,
    pub(crate) persistence_waiters: VecDeque<PersistenceWaiter>,
    pub(crate) transaction_context_waiters: VecDeque<TransactionContextWaiter>,

    pub(crate) runtime_transaction: RuntimeTransactionSlot,
    pub(crate) transaction_mailbox: Option<UnboundedReceiver<TransactionMessage>>,
    pub(crate) is_root_cancel_pending: bool,

    pub(crate) pending_termination: Option<Fault>,
    pub(crate) abort_reason: Option<ErrorDetails>,
    pub(crate) is_aborted: bool,
    pub(crate) pending_unhandled: Option<(Fault, InstanceId)>,
    deferred_action: Option<RequestedAction>,

    pub(crate) root_argument_overrides: BTreeMap<String, Value>,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) async_operations: BTreeMap<OperationId, AsyncOperationContext>,
    pub(crate) next_operation_id: u64,
    pub(crate) host_requests: Vec<HostRequest>,
    pub(crate) pending_update: Option<PendingUpdate>,
}

impl std::fmt::Debug for ActivityExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityExecutor")
            .field("instance_id", &self.instance_id)
            .field("identity", &self.identity)
            .field("instances", &self.instances.len())
            .field("pending_work", &self.scheduler.pending_count())
            .field("execution_state", &self.execution_state)
            .finish()
    }
}

impl ActivityExecutor {
    pub fn new(
        root: Arc<dyn Activity>,
        identity: WorkflowIdentity,
        host: Arc<dyn WorkflowHost>,
        settings: ExecutorSettings,
    ) -> Result<Self, WorkflowError> {
        let definition = Arc::new(ActivityTable::build(root)?);
        Ok(Self::from_parts(Uuid::new_v4(), identity, definition, host, settings))
    }

    fn from_parts(
        instance_id: Uuid,
        identity: WorkflowIdentity,
        definition: Arc<ActivityTable>,
        host: Arc<dyn WorkflowHost>,
        settings: ExecutorSettings,
    ) -> Self {
        let participants = host.tracking_participants();
        Self {
            instance_id,
            identity,
            definition,
            host,
            settings,
            metrics: None,
            participants,
            scheduler: Scheduler::default(),
            instances: InstanceMap::default(),
            environments: EnvironmentArena::default(),
            bookmarks: BookmarkManager::default(),
            scopes: BookmarkScopeManager::default(),
            mappable: BTreeMap::new(),
            root: None,
            secondary_roots: BTreeSet::new(),
            root_state: None,
            execution_state: None,
            workflow_outputs: BTreeMap::new(),
            completion_exception: None,
            main_body_complete_raised: false,
            next_tracking_record_number: 0,
            no_persist_count: 0,
            persistence_waiters: VecDeque::new(),
            transaction_context_waiters: VecDeque::new(),
            runtime_transaction: Arc::new(Mutex::new(None)),
            transaction_mailbox: None,
            is_root_cancel_pending: false,
            pending_termination: None,
            abort_reason: None,
            is_aborted: false,
            pending_unhandled: None,
            deferred_action: None,
            root_argument_overrides: BTreeMap::new(),
            in_flight: None,
            async_operations: BTreeMap::new(),
            next_operation_id: 0,
            host_requests: Vec::new(),
            pending_update: None,
        }
    }

    pub fn with_instance_id(mut self, instance_id: Uuid) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsProvider>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Create the root instance and queue its execution.
    ///
    /// `inputs` override the root's in and in-out arguments by name.
    pub fn schedule_root_activity(
        &mut self,
        inputs: BTreeMap<String, Value>,
        host_properties: ExecutionProperties,
    ) -> Result<InstanceId, WorkflowError> {
        if self.root.is_some() {
            return Err(WorkflowError::invalid_operation("the root activity is already scheduled"));
        }
        let root_node = self.definition.root();
        for name in inputs.keys() {
            let accepted = root_node
                .layout
                .arguments
                .iter()
                .any(|a| a.name == *name && a.direction != ArgumentDirection::Out);
            if !accepted {
                return Err(WorkflowError::invalid_argument(format!(
                    "{} has no input argument named '{name}'",
                    root_node.display_name
                )));
            }
        }
        let root_activity = root_node.id;
        self.root_argument_overrides = inputs;

        let id = self.create_instance(root_activity, None, None)?;
        if let Some(instance) = self.instances.get_mut(id) {
            instance.properties.merge(host_properties);
        }
        self.root = Some(id);
        self.scheduler.push_work(WorkItem::new(
            id,
            WorkItemKind::ExecuteRoot {
                requires_initialization: true,
            },
        ));
        self.track_workflow(WorkflowInstanceEvent::Started);
        tracing::debug!(
            target: "duroflow::runtime",
            instance_id = %self.instance_id,
            root = %self.definition.root().display_name,
            "root activity scheduled"
        );
        Ok(id)
    }

    /// Drive the scheduler until it idles, completes, pauses, aborts or a
    /// work item waits on the host.
    pub fn run(&mut self) -> Result<SchedulerOutcome, WorkflowError> {
        if self.in_flight.is_some() {
            return Ok(SchedulerOutcome::Pending);
        }
        if self.is_aborted {
            return Ok(SchedulerOutcome::Aborted(self.aborted_reason()));
        }
        match self.deferred_action.take() {
            Some(RequestedAction::Abort) => return Ok(self.on_abort()),
            Some(RequestedAction::NotifyUnhandledException { fault, source }) => {
                return Ok(self.on_unhandled_exception(fault, source));
            }
            _ => {}
        }
        self.pending_update = None;
        scheduler::run(self)
    }

    /// Stop at the next work-item boundary.
    pub fn pause_scheduler(&mut self) {
        self.scheduler.pause();
    }

    /// Resume a bookmark with `value`. Success queues the resumption behind
    /// work already scheduled.
    pub fn try_resume_bookmark(&mut self, bookmark: &Bookmark, value: Value) -> BookmarkResumptionResult {
        let isolation = self.isolation_scope();
        let instances = &self.instances;
        let outcome = self
            .bookmarks
            .try_generate_work_item(bookmark, value, |owner| Self::is_ready(instances, isolation, owner));
        self.accept_resumption(outcome)
    }

    pub fn try_resume_bookmark_in_scope(
        &mut self,
        scope: Uuid,
        bookmark: &Bookmark,
        value: Value,
    ) -> BookmarkResumptionResult {
        let isolation = self.isolation_scope();
        let Ok(manager) = self.scopes.scope_mut(scope) else {
            return BookmarkResumptionResult::NotFound;
        };
        let instances = &self.instances;
        let outcome =
            manager.try_generate_work_item(bookmark, value, |owner| Self::is_ready(instances, isolation, owner));
        self.accept_resumption(outcome)
    }

    fn is_ready(instances: &InstanceMap, isolation: Option<InstanceId>, owner: InstanceId) -> bool {
        if !instances.get(owner).is_some_and(|i| !i.is_completed()) {
            return false;
        }
        isolation.is_none_or(|scope| instances.is_in_subtree(scope, owner))
    }

    fn accept_resumption(
        &mut self,
        outcome: Result<(WorkItem, crate::runtime::bookmarks::BookmarkRecord), BookmarkResumptionResult>,
    ) -> BookmarkResumptionResult {
        let (item, record) = match outcome {
            Ok(pair) => pair,
            Err(result) => return result,
        };
        if let Some(owner) = self.instances.get_mut(record.owner) {
            owner.increment_busy_count();
            if !record.options.non_blocking {
                owner.blocking_bookmark_count = owner.blocking_bookmark_count.saturating_sub(1);
            }
        }
        if let WorkItemKind::BookmarkResumption { bookmark, value, .. } = &item.kind {
            let owner = self.activity_ref(record.owner);
            let (bookmark, value) = (bookmark.clone(), value.clone());
            self.track(|record_number| TrackingRecord::BookmarkResumption {
                record_number,
                bookmark,
                owner,
                value,
            });
        }
        if let Some(m) = &self.metrics {
            m.record_bookmark_resumed();
        }
        self.scheduler.enqueue_work(item);
        BookmarkResumptionResult::Success
    }

    /// Request cancellation of the workflow root. Deferred while an ambient
    /// transaction is active.
    pub fn cancel_root_activity(&mut self) {
        let Some(root) = self.root else {
            return;
        };
        if !self.instances.get(root).is_some_and(|r| !r.is_completed()) {
            return;
        }
        if self.isolation_scope().is_some() {
            self.is_root_cancel_pending = true;
            return;
        }
        self.cancel_activity(root);
    }

    /// Tear the instance down with `reason` as its completion exception.
    /// During a run the current work item finishes and the queue is dropped;
    /// the teardown happens when the scheduler idles.
    pub fn terminate(&mut self, reason: Fault) {
        if self.execution_state.is_some() || self.is_aborted {
            return;
        }
        if self.in_flight.is_none() {
            self.scheduler.clear_all_work_items();
        }
        self.pending_termination = Some(reason);
    }

    /// Abort the instance. Outside a run this happens immediately; during a
    /// run it happens at the end of the current work item.
    pub fn abort_workflow_instance(&mut self, reason: ErrorDetails) {
        if self.is_aborted || self.abort_reason.is_some() {
            return;
        }
        tracing::warn!(
            target: "duroflow::runtime",
            instance_id = %self.instance_id,
            category = reason.category(),
            reason = %reason,
            "aborting workflow instance"
        );
        self.abort_reason = Some(reason);
        if !self.scheduler.is_running() {
            self.finalize_abort();
        }
    }

    /// Requests recorded since the last call.
    pub fn take_host_requests(&mut self) -> Vec<HostRequest> {
        std::mem::take(&mut self.host_requests)
    }

    pub fn has_host_requests(&self) -> bool {
        !self.host_requests.is_empty()
    }

    pub(crate) fn allocate_operation(&mut self) -> OperationId {
        self.next_operation_id += 1;
        OperationId(self.next_operation_id)
    }

    fn take_in_flight(&mut self, operation: OperationId, stages: &[InFlightStage]) -> Result<InFlight, WorkflowError> {
        match self.in_flight.take() {
            Some(in_flight) if in_flight.operation == operation && stages.contains(&in_flight.stage) => Ok(in_flight),
            other => {
                self.in_flight = other;
                Err(WorkflowError::invalid_operation(format!(
                    "operation {operation} is not outstanding"
                )))
            }
        }
    }

    /// Report the outcome of a [`HostRequest::Persist`].
    pub fn complete_host_operation(
        &mut self,
        operation: OperationId,
        result: Result<(), ErrorDetails>,
    ) -> Result<(), WorkflowError> {
        let in_flight = self.take_in_flight(operation, &[InFlightStage::Persist, InFlightStage::PersistBeforeCommit])?;
        let mut item = in_flight.item;
        match (in_flight.stage, result) {
            (InFlightStage::Persist, Ok(())) => {
                if let Some(m) = &self.metrics {
                    m.record_persist();
                }
                self.track_workflow(WorkflowInstanceEvent::Persisted);
            }
            (InFlightStage::PersistBeforeCommit, Ok(())) => {
                if let Some(m) = &self.metrics {
                    m.record_persist();
                }
                self.track_workflow(WorkflowInstanceEvent::Persisted);
                if let Some(awaiting) = self.commit_transaction(&mut item) {
                    self.in_flight = Some(InFlight {
                        operation: awaiting,
                        stage: InFlightStage::AwaitTransactionOutcome,
                        item,
                    });
                    return Ok(());
                }
            }
            (_, Err(reason)) => {
                if let Some(m) = &self.metrics {
                    m.record_persist_failure();
                }
                tracing::error!(
                    target: "duroflow::runtime",
                    instance_id = %self.instance_id,
                    error = %reason,
                    "persistence failed"
                );
                item.workflow_abort = Some(reason);
            }
            (InFlightStage::AwaitTransactionOutcome, Ok(())) => {
                return Err(WorkflowError::invalid_operation("operation awaits a transaction outcome"));
            }
        }
        self.finish_resumed_item(item);
        Ok(())
    }

    /// Report the outcome of a [`HostRequest::AwaitTransactionOutcome`].
    /// `None` means the wait timed out.
    pub fn complete_transaction_outcome(
        &mut self,
        operation: OperationId,
        outcome: Option<TransactionMessage>,
    ) -> Result<(), WorkflowError> {
        let in_flight = self.take_in_flight(operation, &[InFlightStage::AwaitTransactionOutcome])?;
        let mut item = in_flight.item;
        self.finish_transaction(&mut item, outcome);
        self.finish_resumed_item(item);
        Ok(())
    }

    fn finish_resumed_item(&mut self, item: WorkItem) {
        let action = self.finish_work_item(item);
        if action != RequestedAction::Continue {
            self.deferred_action = Some(action);
        }
    }

    /// Deliver the result of a [`HostRequest::RunAsync`].
    pub fn complete_async_operation(
        &mut self,
        operation: OperationId,
        result: Result<Value, Fault>,
    ) -> Result<(), WorkflowError> {
        let context = self
            .async_operations
            .remove(&operation)
            .ok_or_else(|| WorkflowError::invalid_operation(format!("operation {operation} is not outstanding")))?;
        let owner = self.activity_ref(context.owner);
        let value = match &result {
            Ok(v) => v.clone(),
            Err(f) => serde_json::to_value(f).unwrap_or(Value::Null),
        };
        self.track(|record_number| TrackingRecord::BookmarkResumption {
            record_number,
            bookmark: Bookmark::AsyncOperationCompletion,
            owner,
            value,
        });
        self.scheduler.enqueue_work(WorkItem::new(
            context.owner,
            WorkItemKind::CompleteAsyncOperation {
                operation,
                callback: context.callback,
                result,
            },
        ));
        Ok(())
    }

    /// Whether a snapshot taken now is consistent.
    pub fn is_persistable(&self) -> bool {
        self.no_persist_count == 0
            && self.in_flight.is_none()
            && self.isolation_scope().is_none()
            && !self.scheduler.is_running()
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn identity(&self) -> &WorkflowIdentity {
        &self.identity
    }

    pub fn definition(&self) -> &Arc<ActivityTable> {
        &self.definition
    }

    pub fn instances(&self) -> &InstanceMap {
        &self.instances
    }

    pub fn environments(&self) -> &EnvironmentArena {
        &self.environments
    }

    pub fn bookmarks(&self) -> &BookmarkManager {
        &self.bookmarks
    }

    pub fn bookmark_scopes(&self) -> &BookmarkScopeManager {
        &self.scopes
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn root_instance(&self) -> Option<InstanceId> {
        self.root
    }

    pub fn secondary_roots(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.secondary_roots.iter().copied()
    }

    /// Final state once every root completed.
    pub fn execution_state(&self) -> Option<ActivityInstanceState> {
        self.execution_state
    }

    pub fn workflow_outputs(&self) -> &BTreeMap<String, Value> {
        &self.workflow_outputs
    }

    pub fn completion_exception(&self) -> Option<&Fault> {
        self.completion_exception.as_ref()
    }

    pub fn is_aborted(&self) -> bool {
        self.is_aborted
    }

    pub fn no_persist_count(&self) -> u32 {
        self.no_persist_count
    }

    pub fn has_active_transaction(&self) -> bool {
        self.isolation_scope().is_some()
    }

    pub fn has_pending_operations(&self) -> bool {
        self.in_flight.is_some() || !self.async_operations.is_empty()
    }

    pub fn mappable_locations(&self) -> Vec<MappableLocation> {
        self.mappable
            .iter()
            .filter_map(|(location, name)| {
                let env = self.environments.get(location.environment)?;
                let cell = env.get(location.ordinal)?;
                Some(MappableLocation {
                    name: name.clone(),
                    location: *location,
                    owner: env.owner,
                    value: cell.value.clone(),
                })
            })
            .collect()
    }

    pub(crate) fn isolation_scope(&self) -> Option<InstanceId> {
        lock(&self.runtime_transaction)
            .as_ref()
            .map(|data| lock(data).isolation_scope)
    }

    pub(crate) fn enter_no_persist(&mut self) {
        self.no_persist_count += 1;
    }

    pub(crate) fn exit_no_persist(&mut self) {
        if self.no_persist_count == 0 {
            tracing::warn!(target: "duroflow::runtime", instance_id = %self.instance_id, "unbalanced no-persist exit");
            return;
        }
        self.no_persist_count -= 1;
    }

    pub(crate) fn register_mappables(&mut self, environment: EnvironmentId) {
        let Some(env) = self.environments.get(environment) else {
            return;
        };
        let entries: Vec<(LocationRef, String)> = env
            .locations()
            .iter()
            .enumerate()
            .filter(|(_, l)| l.mappable)
            .map(|(ordinal, l)| (LocationRef { environment, ordinal }, l.name.clone()))
            .collect();
        self.mappable.extend(entries);
    }

    pub(crate) fn activity_ref(&self, instance: InstanceId) -> ActivityRef {
        let (activity, display_name) = self
            .instances
            .get(instance)
            .map(|i| {
                let name = self
                    .definition
                    .get(i.activity)
                    .map(|n| n.display_name.clone())
                    .unwrap_or_default();
                (i.activity, name)
            })
            .unwrap_or_default();
        ActivityRef {
            instance,
            activity,
            display_name,
        }
    }

    pub(crate) fn track(&mut self, make: impl FnOnce(u64) -> TrackingRecord) {
        if self.participants.is_empty() {
            return;
        }
        self.next_tracking_record_number += 1;
        let record = make(self.next_tracking_record_number);
        for participant in &self.participants {
            participant.track(&record);
        }
    }

    pub(crate) fn track_workflow(&mut self, event: WorkflowInstanceEvent) {
        let workflow = self.instance_id;
        self.track(|record_number| TrackingRecord::WorkflowInstance {
            record_number,
            workflow,
            event,
        });
    }

    fn aborted_reason(&self) -> ErrorDetails {
        self.abort_reason
            .clone()
            .unwrap_or_else(|| ErrorDetails::infrastructure("abort", "workflow instance was aborted"))
    }

    /// Tear everything down after an abort was requested.
    pub(crate) fn finalize_abort(&mut self) {
        if self.is_aborted {
            return;
        }
        self.is_aborted = true;
        let reason = self.aborted_reason();
        let fault = reason.to_fault();

        self.scheduler.clear_all_work_items();
        self.in_flight = None;
        let roots: Vec<InstanceId> = self.root.into_iter().chain(self.secondary_roots.iter().copied()).collect();
        for root in roots {
            if self.instances.get(root).is_some_and(|i| !i.is_completed()) {
                self.abort_activity_instance(root, &fault, false);
            }
        }
        self.rollback_transaction(&fault.message);
        self.persistence_waiters.clear();
        self.transaction_context_waiters.clear();
        self.async_operations.clear();
        self.pending_termination = None;
        self.pending_unhandled = None;
        self.no_persist_count = 0;
        self.execution_state = Some(ActivityInstanceState::Faulted);
        self.completion_exception = Some(fault);
        self.instances.flush_retired();

        if let Err(e) = self.host.on_request_abort(&reason) {
            tracing::error!(target: "duroflow::runtime", instance_id = %self.instance_id, error = %e, "abort notification failed");
        }
        if let Some(m) = &self.metrics {
            m.record_instance_aborted();
        }
        self.track_workflow(WorkflowInstanceEvent::Aborted);
    }

    fn finalize_termination(&mut self, reason: Fault) {
        tracing::info!(
            target: "duroflow::runtime",
            instance_id = %self.instance_id,
            reason = %reason,
            "terminating workflow instance"
        );
        self.scheduler.clear_all_work_items();
        let roots: Vec<InstanceId> = self.root.into_iter().chain(self.secondary_roots.iter().copied()).collect();
        for root in roots {
            if self.instances.get(root).is_some_and(|i| !i.is_completed()) {
                self.abort_activity_instance(root, &reason, false);
            }
        }
        self.rollback_transaction(&reason.message);
        self.persistence_waiters.clear();
        self.transaction_context_waiters.clear();
        self.no_persist_count = 0;
        self.instances.flush_retired();
        self.execution_state = Some(ActivityInstanceState::Faulted);
        self.completion_exception = Some(reason);
        self.track_workflow(WorkflowInstanceEvent::Terminated);
    }

    fn notify_host_failure(&mut self, error: crate::errors::CallbackError) -> SchedulerOutcome {
        self.abort_workflow_instance(error.into());
        self.finalize_abort();
        SchedulerOutcome::Aborted(self.aborted_reason())
    }
}

impl SchedulerCallbacks for ActivityExecutor {
    fn scheduler(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    fn execute_work_item(&mut self, item: WorkItem) -> RequestedAction {
        self.dispatch(item)
    }

    fn on_scheduler_idle(&mut self) -> IdleDecision {
        if let Some(reason) = self.pending_termination.take() {
            self.finalize_termination(reason);
        }

        if self.execution_state.is_none()
            && let Some(front) = self.transaction_context_waiters.front()
            && (self.is_persistable_while_running() || (front.requires && self.no_persist_count == 1))
            && let Some(waiter) = self.transaction_context_waiters.pop_front()
        {
            self.scheduler.enqueue_work(WorkItem::new(
                waiter.instance,
                WorkItemKind::TransactionContext {
                    callback: waiter.callback,
                    requires: waiter.requires,
                },
            ));
            return IdleDecision::Resume;
        }

        if self.execution_state.is_none()
            && self.is_persistable_while_running()
            && let Some(waiter) = self.persistence_waiters.pop_front()
        {
            self.scheduler.enqueue_work(WorkItem::new(
                waiter.instance,
                WorkItemKind::Persist {
                    callback: waiter.callback,
                },
            ));
            return IdleDecision::Resume;
        }

        if let Some(state) = self.execution_state {
            if !self.main_body_complete_raised {
                self.main_body_complete_raised = true;
                if let Err(e) = self.host.notify_main_body_complete(state) {
                    return IdleDecision::Stop(self.notify_host_failure(e));
                }
                if let Some(m) = &self.metrics {
                    m.record_instance_completed();
                }
                let event = match state {
                    ActivityInstanceState::Closed => WorkflowInstanceEvent::Completed,
                    ActivityInstanceState::Canceled => WorkflowInstanceEvent::Canceled,
                    _ => WorkflowInstanceEvent::Faulted,
                };
                self.track_workflow(event);
                tracing::info!(
                    target: "duroflow::runtime",
                    instance_id = %self.instance_id,
                    state = %state,
                    "workflow completed"
                );
            }
            return IdleDecision::Stop(SchedulerOutcome::Completed(state));
        }

        if let Err(e) = self.host.notify_paused() {
            return IdleDecision::Stop(self.notify_host_failure(e));
        }
        self.track_workflow(WorkflowInstanceEvent::Idle);
        IdleDecision::Stop(SchedulerOutcome::Idle)
    }

    fn on_scheduler_paused(&mut self) -> SchedulerOutcome {
        if let Err(e) = self.host.notify_paused() {
            return self.notify_host_failure(e);
        }
        SchedulerOutcome::Paused
    }

    fn on_unhandled_exception(&mut self, fault: Fault, source: InstanceId) -> SchedulerOutcome {
        self.track_workflow(WorkflowInstanceEvent::UnhandledException);
        tracing::warn!(
            target: "duroflow::runtime",
            instance_id = %self.instance_id,
            source = %source,
            fault = %fault,
            "unhandled fault"
        );
        if let Err(e) = self.host.notify_unhandled_exception(&fault, source) {
            return self.notify_host_failure(e);
        }
        SchedulerOutcome::UnhandledException { fault, source }
    }

    fn on_abort(&mut self) -> SchedulerOutcome {
        self.finalize_abort();
        SchedulerOutcome::Aborted(self.aborted_reason())
    }
}

impl ActivityExecutor {
    /// Persistability as seen from inside the run loop.
    fn is_persistable_while_running(&self) -> bool {
        self.no_persist_count == 0 && self.isolation_scope().is_none()
    }
}
