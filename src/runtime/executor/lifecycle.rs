//! Instance creation, completion, cancellation, abort and fault propagation.

use std::any::TypeId;

use super::ActivityExecutor;
use crate::Value;
use crate::activity::{ArgumentDirection, CompletedChild};
use crate::definition::ArgumentSource;
use crate::errors::{CallbackError, ErrorDetails, Fault, FaultSource, WorkflowError, invoke_guarded};
use crate::ids::{ActivityId, EnvironmentId, InstanceId};
use crate::runtime::environment::DisposedEnvironment;
use crate::runtime::extensions::ExceptionPersistence;
use crate::runtime::instance::{ActivityInstance, ActivityInstanceState, Substate};
use crate::runtime::location::HandleState;
use crate::runtime::lock;
use crate::runtime::tracking::TrackingRecord;
use crate::runtime::work_item::{WorkItem, WorkItemKind};

/// How a child is attached when it is scheduled.
#[derive(Debug, Default)]
pub(crate) struct ChildOptions<'a> {
    pub(crate) child_index: Option<usize>,
    pub(crate) on_completed: Option<&'a str>,
    pub(crate) on_faulted: Option<&'a str>,
    /// Values for the handler's delegate arguments
    pub(crate) delegate_arguments: Option<Vec<Value>>,
}

impl ActivityExecutor {
    pub(crate) fn is_live(&self, id: InstanceId) -> bool {
        self.instances.get(id).is_some_and(|i| !i.is_completed())
    }

    pub(crate) fn create_instance(
        &mut self,
        activity: ActivityId,
        parent: Option<InstanceId>,
        parent_environment: Option<EnvironmentId>,
    ) -> Result<InstanceId, WorkflowError> {
        let definition = self.definition.clone();
        let node = definition.node(activity)?;
        let id = self.instances.allocate_id()?;
        let mut instance = ActivityInstance::new(id, activity, parent);
        if node.layout.symbol_count() > 0 {
            let env = self.environments.create(parent_environment, activity, id, &node.layout)?;
            instance.environment = Some(env);
            instance.owns_environment = true;
            self.instances.insert(instance);
            self.register_mappables(env);
        } else {
            instance.environment = parent_environment;
            self.instances.insert(instance);
        }

        let activity = self.activity_ref(id);
        let parent = parent.map(|p| self.activity_ref(p));
        self.track(|record_number| TrackingRecord::ActivityScheduled {
            record_number,
            activity,
            parent,
        });
        Ok(id)
    }

    /// Create a child of `parent` and queue its execution ahead of pending work.
    pub(crate) fn schedule_child_instance(
        &mut self,
        parent: InstanceId,
        activity: ActivityId,
        options: ChildOptions<'_>,
    ) -> Result<InstanceId, WorkflowError> {
        let parent_environment = match self.instances.get(parent) {
            Some(p) if !p.is_completed() => p.environment,
            _ => {
                return Err(WorkflowError::invalid_operation(format!(
                    "{parent} cannot schedule children once completed"
                )));
            }
        };
        if let Some(values) = &options.delegate_arguments {
            let expected = self.definition.node(activity)?.layout.delegate_arguments.len();
            if values.len() != expected {
                return Err(WorkflowError::invalid_argument(format!(
                    "delegate expects {expected} arguments, got {}",
                    values.len()
                )));
            }
        }

        let id = self.create_instance(activity, Some(parent), parent_environment)?;
        if let Some(values) = options.delegate_arguments {
            self.write_delegate_arguments(id, values)?;
        }
        if let Some(instance) = self.instances.get_mut(id) {
            instance.child_index = options.child_index;
            instance.completion_callback = options.on_completed.map(str::to_string);
            instance.fault_callback = options.on_faulted.map(str::to_string);
        }
        if let Some(p) = self.instances.get_mut(parent) {
            p.children.insert(id);
        }
        self.scheduler.push_work(WorkItem::new(id, WorkItemKind::ExecuteActivity));
        Ok(id)
    }

    fn write_delegate_arguments(&mut self, id: InstanceId, values: Vec<Value>) -> Result<(), WorkflowError> {
        let Some(instance) = self.instances.get(id) else {
            return Ok(());
        };
        let (Some(env_id), true) = (instance.environment, instance.owns_environment) else {
            return Ok(());
        };
        let definition = self.definition.clone();
        let layout = &definition.node(instance.activity)?.layout;
        let Some(env) = self.environments.get_mut(env_id) else {
            return Ok(());
        };
        for (index, value) in values.into_iter().enumerate() {
            if let Some(location) = layout.delegate_argument_ordinal(index).and_then(|o| env.get_mut(o)) {
                location.value = value;
            }
        }
        Ok(())
    }

    /// Schedule an independent root that reads through `caller`'s
    /// environment chain and keeps it alive until it completes.
    pub(crate) fn schedule_secondary_root(
        &mut self,
        caller: InstanceId,
        activity: ActivityId,
    ) -> Result<InstanceId, WorkflowError> {
        let environment = self.instances.get(caller).and_then(|i| i.environment);
        let id = self.create_instance(activity, None, environment)?;
        if let Some(env) = environment {
            self.environments.add_reference(env);
        }
        if let Some(instance) = self.instances.get_mut(id) {
            instance.is_secondary_root = true;
        }
        self.secondary_roots.insert(id);
        self.scheduler.push_work(WorkItem::new(id, WorkItemKind::ExecuteActivity));
        Ok(id)
    }

    pub(crate) fn completed_child(&self, id: InstanceId) -> CompletedChild {
        let instance = self.instances.get(id);
        let activity = instance.map(|i| i.activity).unwrap_or_default();
        CompletedChild {
            instance: id,
            activity,
            display_name: self
                .definition
                .get(activity)
                .map(|n| n.display_name.clone())
                .unwrap_or_default(),
            state: instance.map_or(ActivityInstanceState::Faulted, |i| i.state),
            child_index: instance.and_then(|i| i.child_index),
            result: instance.and_then(|i| i.result.clone()),
        }
    }

    pub(crate) fn fault_source(&self, id: InstanceId) -> FaultSource {
        let r = self.activity_ref(id);
        FaultSource {
            instance: r.instance,
            activity: r.activity,
            display_name: r.display_name,
        }
    }

    /// Re-evaluate an instance after a work item targeting it finished.
    pub(crate) fn update_state(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };
        if instance.is_completed() || instance.has_pending_work() {
            return;
        }
        match instance.substate {
            Substate::Created => {
                if instance.is_cancellation_requested {
                    self.complete_activity_instance(id, ActivityInstanceState::Canceled);
                }
            }
            Substate::ResolvingArguments => {
                if instance.is_cancellation_requested {
                    self.complete_activity_instance(id, ActivityInstanceState::Canceled);
                } else {
                    let next_index = instance.next_argument_index;
                    self.scheduler
                        .push_work(WorkItem::new(id, WorkItemKind::ResolveNextArgument { next_index }));
                }
            }
            Substate::Executing => {
                let state = instance.closing_state();
                if !self.is_completing_transaction(id) {
                    self.complete_activity_instance(id, state);
                }
            }
        }
    }

    /// Close an instance normally and notify its parent.
    pub(crate) fn complete_activity_instance(&mut self, id: InstanceId, state: ActivityInstanceState) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        instance.state = state;
        let parent = instance.parent;
        let completion_callback = instance.completion_callback.clone();
        let result = instance.result.clone();
        let result_location = instance.result_location;

        if state == ActivityInstanceState::Closed {
            self.copy_out_arguments(id);
            if let (Some(location), Some(value)) = (result_location, result)
                && let Some(cell) = self
                    .environments
                    .get_mut(location.environment)
                    .and_then(|env| env.get_mut(location.ordinal))
            {
                cell.set_resolved(value);
            }
        }
        if Some(id) == self.root {
            self.capture_workflow_outputs(id);
        }

        let activity = self.activity_ref(id);
        self.track(|record_number| TrackingRecord::ActivityState {
            record_number,
            activity,
            state,
        });
        tracing::trace!(target: "duroflow::runtime", instance = %id, state = %state, "activity instance completed");

        let child = self.completed_child(id);
        self.release_instance(id, state);

        if let Some(parent) = parent
            && self.is_live(parent)
        {
            let item = match completion_callback {
                Some(callback) => WorkItem::new(parent, WorkItemKind::CompletionCallback { callback, child }),
                None => WorkItem::empty(parent),
            };
            self.scheduler.push_work(item);
        }
    }

    fn copy_out_arguments(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };
        let (Some(env_id), true) = (instance.environment, instance.owns_environment) else {
            return;
        };
        let definition = self.definition.clone();
        let Some(node) = definition.get(instance.activity) else {
            return;
        };
        let Some(env) = self.environments.get(env_id) else {
            return;
        };
        let caller_env = env.parent;
        let writes: Vec<(String, Value)> = node
            .layout
            .arguments
            .iter()
            .enumerate()
            .filter(|(_, a)| a.direction != ArgumentDirection::In)
            .filter_map(|(ordinal, a)| match &a.source {
                ArgumentSource::Variable(name) => env.get(ordinal).map(|l| (name.clone(), l.value.clone())),
                _ => None,
            })
            .collect();
        for (name, value) in writes {
            match self.environments.resolve(caller_env, &name, false, &definition) {
                Some((target, ordinal)) => {
                    if let Some(cell) = self.environments.get_mut(target).and_then(|e| e.get_mut(ordinal)) {
                        cell.value = value;
                    }
                }
                None => tracing::warn!(
                    target: "duroflow::runtime",
                    instance = %id,
                    variable = %name,
                    "output argument target is not visible"
                ),
            }
        }
    }

    fn capture_workflow_outputs(&mut self, root: InstanceId) {
        let Some(instance) = self.instances.get(root) else {
            return;
        };
        let Some(env) = instance.environment.and_then(|e| self.environments.get(e)) else {
            return;
        };
        let Some(node) = self.definition.get(instance.activity) else {
            return;
        };
        for (ordinal, argument) in node.layout.arguments.iter().enumerate() {
            if argument.direction != ArgumentDirection::In
                && let Some(location) = env.get(ordinal)
            {
                self.workflow_outputs.insert(argument.name.clone(), location.value.clone());
            }
        }
    }

    /// Cleanup shared by completion and abort: bookmarks, waiters,
    /// environments, parent links and root bookkeeping.
    fn release_instance(&mut self, id: InstanceId, state: ActivityInstanceState) {
        self.remove_bookmarks_of(id);
        self.persistence_waiters.retain(|w| w.instance != id);
        let requires_waiters = self
            .transaction_context_waiters
            .iter()
            .filter(|w| w.instance == id && w.requires)
            .count();
        self.transaction_context_waiters.retain(|w| w.instance != id);
        for _ in 0..requires_waiters {
            self.exit_no_persist();
        }
        let owned_operations: Vec<_> = self
            .async_operations
            .iter()
            .filter(|(_, op)| op.owner == id)
            .map(|(op, _)| *op)
            .collect();
        for operation in owned_operations {
            self.async_operations.remove(&operation);
            self.exit_no_persist();
        }

        let Some(instance) = self.instances.get(id) else {
            return;
        };
        let parent = instance.parent;
        let environment = instance.environment;
        let owns = instance.owns_environment;
        let is_secondary_root = instance.is_secondary_root;

        if is_secondary_root {
            let referenced = if owns {
                environment.and_then(|e| self.environments.get(e)).and_then(|e| e.parent)
            } else {
                environment
            };
            if let Some(env) = referenced {
                self.release_environment(env, false);
            }
        }
        if owns && let Some(env) = environment {
            self.release_environment(env, true);
        }
        if let Some(p) = parent.and_then(|p| self.instances.get_mut(p)) {
            p.children.remove(&id);
        }

        if Some(id) == self.root {
            self.root_state = Some(state);
        }
        self.secondary_roots.remove(&id);
        if self.execution_state.is_none() && self.root_state.is_some() && self.secondary_roots.is_empty() {
            self.execution_state = self.root_state;
        }
        self.instances.retire(id);
    }

    pub(crate) fn remove_bookmarks_of(&mut self, id: InstanceId) {
        self.bookmarks.remove_all(id);
        self.scopes.remove_all(id);
        if let Some(instance) = self.instances.get_mut(id) {
            instance.blocking_bookmark_count = 0;
        }
    }

    pub(crate) fn release_environment(&mut self, env: EnvironmentId, is_owner: bool) {
        for disposed in self.environments.remove_reference(env, is_owner) {
            self.dispose_resources(disposed);
        }
    }

    fn dispose_resources(&mut self, disposed: DisposedEnvironment) {
        self.mappable.retain(|location, _| location.environment != disposed.environment);
        for handle in disposed.handles {
            self.uninitialize_handle(handle);
        }
    }

    pub(crate) fn uninitialize_handle(&mut self, handle: HandleState) {
        match handle {
            HandleState::NoPersist { entered: true, .. } => self.exit_no_persist(),
            HandleState::BookmarkScope { scope: Some(scope), .. } => {
                for (_, record) in self.scopes.unregister_scope(scope) {
                    if record.options.non_blocking {
                        continue;
                    }
                    if let Some(owner) = self.instances.get_mut(record.owner) {
                        owner.blocking_bookmark_count = owner.blocking_bookmark_count.saturating_sub(1);
                    }
                    if self.is_live(record.owner) {
                        self.scheduler.push_work(WorkItem::empty(record.owner));
                    }
                }
            }
            HandleState::RuntimeTransaction { owner } => {
                if self.isolation_scope() == Some(owner) {
                    self.rollback_transaction("transaction handle released");
                }
            }
            _ => {}
        }
    }

    /// Request cancellation. Idempotent; an instance that has not started
    /// executing is completed as canceled without running its body.
    pub(crate) fn cancel_activity(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        if instance.is_completed() || instance.is_cancellation_requested {
            return;
        }
        instance.is_cancellation_requested = true;
        let executed = instance.has_executed();
        let children: Vec<InstanceId> = instance.children.iter().copied().collect();

        let activity = self.activity_ref(id);
        self.track(|record_number| TrackingRecord::CancelRequested { record_number, activity });

        if executed {
            self.scheduler.push_work(WorkItem::new(id, WorkItemKind::Cancel));
        } else {
            for child in children {
                self.cancel_activity(child);
            }
            self.scheduler.push_work(WorkItem::empty(id));
        }
    }

    /// Tear down `id` and its descendants as faulted.
    pub(crate) fn abort_activity_instance(&mut self, id: InstanceId, reason: &Fault, notify_parent: bool) {
        let parent = self.instances.get(id).and_then(|i| i.parent);
        for target in self.instances.post_order(id) {
            if !self.is_live(target) {
                continue;
            }
            self.terminate_special_execution_blocks(target, reason);

            let activity = self
                .instances
                .get(target)
                .and_then(|i| self.definition.get(i.activity))
                .map(|n| n.activity.clone());
            if let Some(activity) = activity
                && let Err(e) = invoke_guarded(|| {
                    activity.abort(reason);
                    Ok(())
                })
            {
                tracing::debug!(target: "duroflow::runtime", instance = %target, error = %e, "abort notification failed");
            }

            if let Some(instance) = self.instances.get_mut(target) {
                instance.state = ActivityInstanceState::Faulted;
            }
            let activity = self.activity_ref(target);
            self.track(|record_number| TrackingRecord::ActivityState {
                record_number,
                activity,
                state: ActivityInstanceState::Faulted,
            });
            self.release_instance(target, ActivityInstanceState::Faulted);
        }
        if notify_parent
            && let Some(parent) = parent
            && self.is_live(parent)
        {
            self.scheduler.push_work(WorkItem::empty(parent));
        }
    }

    fn exception_persistence(&self) -> Result<bool, CallbackError> {
        let extension = self.host.get_extension(TypeId::of::<ExceptionPersistence>())?;
        Ok(extension
            .and_then(|e| e.downcast::<ExceptionPersistence>().ok())
            .is_none_or(|p| p.persist_exceptions))
    }

    /// Route a fault to the nearest ancestor that registered a fault
    /// callback for the path it travels.
    ///
    /// Crossing the active isolation scope aborts that scope first; the fault
    /// then continues from it. A fault that reaches an instance being
    /// canceled aborts the workflow instance. With no handler the fault is
    /// reported as unhandled at the end of the work item.
    pub(crate) fn propagate_exception(&mut self, source: InstanceId, fault: Fault) {
        if let Some(m) = &self.metrics {
            m.record_fault_propagated();
        }
        let persist_exceptions = match self.exception_persistence() {
            Ok(p) => p,
            Err(e) => {
                self.abort_workflow_instance(e.into());
                return;
            }
        };
        if !persist_exceptions {
            self.enter_no_persist();
        }

        let isolation = self.isolation_scope();
        let mut cursor = Some(source);
        let mut target = None;
        while let Some(id) = cursor {
            let Some(instance) = self.instances.get(id) else {
                break;
            };
            if !instance.is_completed() && isolation == Some(id) {
                let mut item = WorkItem::new(
                    id,
                    WorkItemKind::AbortActivity {
                        reason: fault,
                        origin: source,
                    },
                );
                item.exit_no_persist_required = !persist_exceptions;
                self.scheduler.push_work(item);
                if let Some(data) = lock(&self.runtime_transaction).as_ref() {
                    lock(data).should_schedule_completion = false;
                }
                return;
            }
            if instance.is_cancellation_requested {
                if !persist_exceptions {
                    self.exit_no_persist();
                }
                let message = format!(
                    "fault raised by {source} cannot propagate through {id} while it is canceling"
                );
                self.abort_workflow_instance(ErrorDetails::Application(
                    Fault::invalid_operation(message).with_inner(fault),
                ));
                return;
            }
            if let Some(callback) = &instance.fault_callback {
                target = Some((id, callback.clone(), instance.parent));
                break;
            }
            cursor = instance.parent;
        }

        let source_ref = self.activity_ref(source);
        match target {
            Some((carrier, callback, Some(handler))) => {
                let handler_ref = self.activity_ref(handler);
                let tracked = fault.clone();
                self.track(|record_number| TrackingRecord::FaultPropagation {
                    record_number,
                    source: source_ref,
                    handler: Some(handler_ref),
                    fault: tracked,
                });
                let propagated_from = self.completed_child(carrier);
                let mut item = WorkItem::new(
                    handler,
                    WorkItemKind::FaultCallback {
                        callback,
                        fault,
                        propagated_from,
                    },
                );
                item.exit_no_persist_required = !persist_exceptions;
                self.scheduler.push_work(item);
            }
            _ => {
                let tracked = fault.clone();
                self.track(|record_number| TrackingRecord::FaultPropagation {
                    record_number,
                    source: source_ref,
                    handler: None,
                    fault: tracked,
                });
                if !persist_exceptions {
                    self.exit_no_persist();
                }
                if let Some(m) = &self.metrics {
                    m.record_unhandled_fault();
                }
                self.pending_unhandled = Some((fault, source));
            }
        }
    }
}
