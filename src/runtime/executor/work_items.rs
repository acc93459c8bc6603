//! Dispatch of individual work items.

use super::{ActivityExecutor, InFlightStage};
use crate::activity::{Activity, ArgumentDirection, FaultDisposition};
use crate::definition::ArgumentSource;
use crate::errors::{ActivityError, ActivityResult, Fault, WorkflowError, invoke_guarded};
use crate::ids::{InstanceId, OperationId};
use crate::runtime::context::ActivityContext;
use crate::runtime::executor::HostRequest;
use crate::runtime::instance::Substate;
use crate::runtime::location::LocationRef;
use crate::runtime::properties::thread_properties_in_scope;
use crate::runtime::scheduler::RequestedAction;
use crate::runtime::tracking::{TrackingRecord, WorkItemPhase};
use crate::runtime::work_item::{ContinuationReason, WorkItem, WorkItemKind};
use crate::Value;

type Parked = Option<(OperationId, InFlightStage)>;

impl ActivityExecutor {
    pub(crate) fn dispatch(&mut self, mut item: WorkItem) -> RequestedAction {
        if let Some(m) = &self.metrics {
            m.record_work_item();
        }
        let target = item.instance;
        if !self.is_live(target) {
            tracing::trace!(
                target: "duroflow::runtime",
                work_item = item.name(),
                instance = %target,
                "skipping work item for a completed instance"
            );
            if item.exit_no_persist_required {
                self.exit_no_persist();
            }
            if matches!(item.kind, WorkItemKind::CompleteAsyncOperation { .. }) {
                self.exit_no_persist();
            }
            return self.after_work_item();
        }

        let name = item.name();
        let activity = self.activity_ref(target);
        tracing::debug!(
            target: "duroflow::runtime",
            work_item = name,
            instance = %target,
            activity = %activity.display_name,
            "executing work item"
        );
        self.track(|record_number| TrackingRecord::WorkItem {
            record_number,
            activity: activity.clone(),
            kind: name.to_string(),
            phase: WorkItemPhase::Started,
        });

        let properties = thread_properties_in_scope(&self.instances, target);
        let mut entered = 0;
        for property in &properties {
            if let Err(e) = property.setup_workflow_thread() {
                item.workflow_abort = Some(e);
                break;
            }
            entered += 1;
        }
        let parked = if item.workflow_abort.is_none() {
            self.execute_body(&mut item)
        } else {
            None
        };
        for property in properties[..entered].iter().rev() {
            if let Err(e) = property.cleanup_workflow_thread()
                && item.workflow_abort.is_none()
            {
                item.workflow_abort = Some(e);
            }
        }

        if let Some((operation, stage)) = parked {
            self.track(|record_number| TrackingRecord::WorkItem {
                record_number,
                activity,
                kind: name.to_string(),
                phase: WorkItemPhase::Yielded,
            });
            self.in_flight = Some(super::InFlight { operation, stage, item });
            return RequestedAction::YieldSilently;
        }

        self.track(|record_number| TrackingRecord::WorkItem {
            record_number,
            activity,
            kind: name.to_string(),
            phase: WorkItemPhase::Completed,
        });
        self.finish_work_item(item)
    }

    /// Run the item's body. Faults and abort requests are recorded on the
    /// item for [`Self::finish_work_item`].
    fn execute_body(&mut self, item: &mut WorkItem) -> Parked {
        let target = item.instance;
        let result: ActivityResult<Parked> = match item.kind.clone() {
            WorkItemKind::ExecuteActivity
            | WorkItemKind::ExecuteRoot { .. }
            | WorkItemKind::ExecuteExpression { .. } => self.execute_activity(target, 0).map(|_| None),
            WorkItemKind::ResolveNextArgument { next_index } => {
                self.execute_activity(target, next_index).map(|_| None)
            }
            WorkItemKind::Cancel => self.execute_cancel(target).map(|_| None),
            WorkItemKind::AbortActivity { reason, .. } => {
                self.abort_activity_instance(target, &reason, true);
                item.exception_to_propagate = Some(reason);
                Ok(None)
            }
            WorkItemKind::PropagateException { fault } => Err(ActivityError::Fault(fault)),
            WorkItemKind::RethrowException { fault } => {
                self.propagate_exception(target, fault);
                Ok(None)
            }
            WorkItemKind::CompleteTransaction => self.execute_complete_transaction(item),
            WorkItemKind::TransactionContext { callback, requires } => {
                if let Some(instance) = self.instances.get_mut(target) {
                    instance.decrement_busy_count();
                    instance.waiting_for_transaction_context = false;
                }
                let result = self.invoke(target, true, |a, ctx| a.on_transaction_context(ctx, &callback));
                if requires {
                    self.exit_no_persist();
                }
                result.map(|_| None)
            }
            WorkItemKind::Persist { callback } => self.execute_persist(target, callback),
            WorkItemKind::CompleteAsyncOperation { callback, result, .. } => {
                if let Some(instance) = self.instances.get_mut(target) {
                    instance.decrement_busy_count();
                }
                self.exit_no_persist();
                self.invoke(target, false, |a, ctx| a.on_async_completed(ctx, &callback, result))
                    .map(|_| None)
            }
            WorkItemKind::BookmarkResumption { bookmark, callback, value } => {
                if let Some(instance) = self.instances.get_mut(target) {
                    instance.decrement_busy_count();
                }
                self.invoke(target, false, |a, ctx| a.on_bookmark_resumed(ctx, &callback, &bookmark, value))
                    .map(|_| None)
            }
            WorkItemKind::CompletionCallback { callback, child } => self
                .invoke(target, false, |a, ctx| a.on_child_completed(ctx, &callback, &child))
                .map(|_| None),
            WorkItemKind::FaultCallback {
                callback,
                fault,
                propagated_from,
            } => {
                let disposition =
                    self.invoke(target, false, |a, ctx| a.on_child_faulted(ctx, &callback, &fault, &propagated_from));
                match disposition {
                    Ok(FaultDisposition::Handled) => {
                        self.cancel_activity(propagated_from.instance);
                        Ok(None)
                    }
                    Ok(FaultDisposition::Unhandled) => {
                        self.scheduler
                            .push_work(WorkItem::new(target, WorkItemKind::RethrowException { fault }));
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            WorkItemKind::Continuation { callback, .. } => {
                if let Some(instance) = self.instances.get_mut(target) {
                    instance.decrement_busy_count();
                }
                self.invoke(target, false, |a, ctx| a.on_continuation(ctx, &callback))
                    .map(|_| None)
            }
            WorkItemKind::Empty => Ok(None),
        };

        match result {
            Ok(parked) => parked,
            Err(ActivityError::Fault(fault)) => {
                item.exception_to_propagate = Some(fault);
                None
            }
            Err(ActivityError::Abort(reason)) => {
                item.workflow_abort = Some(reason);
                None
            }
        }
    }

    /// Call into the activity that backs `instance` through a fresh context.
    pub(crate) fn invoke<T>(
        &mut self,
        instance: InstanceId,
        allow_transaction: bool,
        f: impl FnOnce(&dyn Activity, &mut ActivityContext<'_>) -> ActivityResult<T>,
    ) -> ActivityResult<T> {
        let activity_id = self
            .instances
            .get(instance)
            .map(|i| i.activity)
            .ok_or_else(|| WorkflowError::invalid_operation(format!("instance {instance} does not exist")))?;
        let definition = self.definition.clone();
        let activity = definition.node(activity_id)?.activity().clone();
        let mut ctx = ActivityContext::new(self, instance, activity_id, allow_transaction);
        invoke_guarded(|| f(activity.as_ref(), &mut ctx))
    }

    /// Resolve arguments from `start` onwards and run the body once they are
    /// all available.
    fn execute_activity(&mut self, id: InstanceId, start: usize) -> ActivityResult {
        let Some(instance) = self.instances.get(id) else {
            return Ok(());
        };
        if instance.is_cancellation_requested {
            return Ok(());
        }
        let expected = if start == 0 {
            Substate::Created
        } else {
            Substate::ResolvingArguments
        };
        if instance.substate != expected {
            return Ok(());
        }
        if !self.resolve_arguments(id, start)? {
            return Ok(());
        }

        if let Some(instance) = self.instances.get(id)
            && instance.owns_environment
            && let Some(env) = instance.environment.and_then(|e| self.environments.get_mut(e))
        {
            env.collapse_temporaries();
        }
        if let Some(instance) = self.instances.get_mut(id) {
            instance.substate = Substate::Executing;
        }
        self.invoke(id, false, |a, ctx| a.execute(ctx))
    }

    /// Returns false when an argument expression was scheduled and
    /// resolution continues once it completes.
    fn resolve_arguments(&mut self, id: InstanceId, start: usize) -> ActivityResult<bool> {
        let Some(instance) = self.instances.get(id) else {
            return Ok(false);
        };
        let (Some(env_id), true) = (instance.environment, instance.owns_environment) else {
            return Ok(true);
        };
        let definition = self.definition.clone();
        let node = definition.node(instance.activity)?;
        let caller_env = self.environments.get(env_id).and_then(|e| e.parent);
        let is_root = Some(id) == self.root;

        for (ordinal, argument) in node.layout.arguments.iter().enumerate().skip(start) {
            let value = if is_root && let Some(value) = self.root_argument_overrides.get(&argument.name) {
                value.clone()
            } else {
                match &argument.source {
                    ArgumentSource::Literal(value) => value.clone(),
                    ArgumentSource::Default => argument.default.clone(),
                    ArgumentSource::Variable(_) if argument.direction == ArgumentDirection::Out => {
                        argument.default.clone()
                    }
                    ArgumentSource::Variable(name) => {
                        let (env, slot) = self
                            .environments
                            .resolve(caller_env, name, false, &definition)
                            .ok_or_else(|| {
                                Fault::new(
                                    "InvalidArgument",
                                    format!(
                                        "{}: variable '{name}' bound to argument '{}' is not visible",
                                        node.display_name, argument.name
                                    ),
                                )
                            })?;
                        self.environments
                            .get(env)
                            .and_then(|e| e.get(slot))
                            .map_or(Value::Null, |l| l.value.clone())
                    }
                    ArgumentSource::Expression(expression) => {
                        self.start_argument_expression(id, env_id, caller_env, ordinal, *expression)?;
                        return Ok(false);
                    }
                }
            };
            if let Some(location) = self.environments.get_mut(env_id).and_then(|e| e.get_mut(ordinal)) {
                location.value = value;
            }
        }
        Ok(true)
    }

    fn start_argument_expression(
        &mut self,
        owner: InstanceId,
        env_id: crate::ids::EnvironmentId,
        caller_env: Option<crate::ids::EnvironmentId>,
        ordinal: usize,
        expression: crate::ids::ActivityId,
    ) -> Result<(), WorkflowError> {
        if let Some(location) = self.environments.get_mut(env_id).and_then(|e| e.get_mut(ordinal)) {
            location.make_temporary();
        }
        let result = LocationRef {
            environment: env_id,
            ordinal,
        };
        let expression_id = self.create_instance(expression, Some(owner), caller_env)?;
        if let Some(instance) = self.instances.get_mut(expression_id) {
            instance.result_location = Some(result);
        }
        if let Some(instance) = self.instances.get_mut(owner) {
            instance.children.insert(expression_id);
            instance.substate = Substate::ResolvingArguments;
            instance.next_argument_index = ordinal + 1;
        }
        self.scheduler
            .push_work(WorkItem::new(expression_id, WorkItemKind::ExecuteExpression { result }));
        Ok(())
    }

    fn execute_cancel(&mut self, id: InstanceId) -> ActivityResult {
        let Some(instance) = self.instances.get_mut(id) else {
            return Ok(());
        };
        if !instance.is_cancellation_requested {
            return Ok(());
        }
        instance.state = crate::runtime::instance::ActivityInstanceState::Canceling;
        self.invoke(id, false, |a, ctx| a.cancel(ctx))
    }

    fn execute_persist(&mut self, target: InstanceId, callback: String) -> ActivityResult<Parked> {
        self.scheduler.push_work(WorkItem::new(
            target,
            WorkItemKind::Continuation {
                callback,
                reason: ContinuationReason::Persisted,
            },
        ));
        let operation = self.allocate_operation();
        let (associate_keys, disassociate_keys) = self.scopes.take_key_changes();
        let snapshot = self.build_snapshot(None);
        self.host_requests.push(HostRequest::Persist {
            operation,
            snapshot: Box::new(snapshot),
            transaction: None,
            associate_keys,
            disassociate_keys,
        });
        Ok(Some((operation, InFlightStage::Persist)))
    }

    /// Post-processing shared by synchronous items and items resumed after a
    /// host operation.
    pub(crate) fn finish_work_item(&mut self, mut item: WorkItem) -> RequestedAction {
        if let Some(reason) = item.workflow_abort.take() {
            self.abort_workflow_instance(reason);
        }
        if self.abort_reason.is_none() {
            let target = item.instance;
            if let Some(fault) = item.exception_to_propagate.take() {
                let fault = fault.sourced(self.fault_source(target));
                tracing::debug!(
                    target: "duroflow::runtime",
                    instance = %target,
                    fault = %fault,
                    "activity faulted"
                );
                if self.is_live(target) {
                    self.abort_activity_instance(target, &fault, true);
                }
                if self.abort_reason.is_none() {
                    self.propagate_exception(target, fault);
                }
            } else if self.is_live(target) {
                self.update_state(target);
            }
        }
        if item.exit_no_persist_required {
            self.exit_no_persist();
        }
        self.after_work_item()
    }

    fn after_work_item(&mut self) -> RequestedAction {
        if self.pending_termination.is_some() {
            // nothing else runs once termination is requested
            self.scheduler.clear_all_work_items();
        } else if self.abort_reason.is_none() {
            self.schedule_transaction_completion();
        }
        self.instances.flush_retired();
        if self.abort_reason.is_some() {
            return RequestedAction::Abort;
        }
        if let Some((fault, source)) = self.pending_unhandled.take() {
            return RequestedAction::NotifyUnhandledException { fault, source };
        }
        RequestedAction::Continue
    }
}
