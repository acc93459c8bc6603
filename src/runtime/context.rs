//! The handle activity code uses to talk to the executor.
//!
//! A context is created for a single callback and borrows the executor for
//! its duration. Everything an activity can do to the running instance goes
//! through it: reading and writing symbols, scheduling children, bookmarks,
//! no-persist zones, persistence, transactions and asynchronous work.

use std::any::Any;
use std::sync::Arc;
use uuid::Uuid;

use crate::Value;
use crate::definition::ActivityNode;
use crate::errors::{ActivityResult, ErrorDetails, Fault, WorkflowError};
use crate::ids::{ActivityId, InstanceId, OperationId};
use crate::runtime::ActivityExecutor;
use crate::runtime::async_operation::{AsyncOperationContext, AsyncWork};
use crate::runtime::bookmarks::{Bookmark, BookmarkOptions};
use crate::runtime::executor::{ChildOptions, HostRequest, PersistenceWaiter};
use crate::runtime::location::{HandleState, LocationRef};
use crate::runtime::properties::{WorkflowThreadProperty, find_property};
use crate::runtime::tracking::TrackingRecord;
use crate::runtime::transaction::Transaction;

pub struct ActivityContext<'a> {
    executor: &'a mut ActivityExecutor,
    instance: InstanceId,
    activity: ActivityId,
    allow_transaction: bool,
}

impl<'a> ActivityContext<'a> {
    pub(crate) fn new(
        executor: &'a mut ActivityExecutor,
        instance: InstanceId,
        activity: ActivityId,
        allow_transaction: bool,
    ) -> Self {
        Self {
            executor,
            instance,
            activity,
            allow_transaction,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    pub fn workflow_instance_id(&self) -> Uuid {
        self.executor.instance_id
    }

    pub fn activity_id(&self) -> ActivityId {
        self.activity
    }

    pub fn display_name(&self) -> &str {
        self.executor
            .definition
            .get(self.activity)
            .map_or("", |n| n.display_name.as_str())
    }

    /// Whether activity-level log macros should emit.
    pub fn is_logging_enabled(&self) -> bool {
        self.executor.settings.activity_logging
    }

    fn node(&self) -> Result<&ActivityNode, WorkflowError> {
        self.executor.definition.node(self.activity)
    }

    // ----- symbols -----

    fn locate(&self, name: &str) -> Result<LocationRef, Fault> {
        let instance = self
            .executor
            .instances
            .get(self.instance)
            .ok_or_else(|| Fault::invalid_operation(format!("instance {} is gone", self.instance)))?;
        let (environment, ordinal) = self
            .executor
            .environments
            .resolve(
                instance.environment,
                name,
                instance.owns_environment,
                &self.executor.definition,
            )
            .ok_or_else(|| {
                Fault::new(
                    "InvalidArgument",
                    format!("'{name}' is not visible from {}", self.display_name()),
                )
            })?;
        Ok(LocationRef { environment, ordinal })
    }

    fn handle_location(&self, name: &str) -> Result<LocationRef, Fault> {
        let location = self.locate(name)?;
        let is_handle = self
            .executor
            .environments
            .get(location.environment)
            .and_then(|e| e.get(location.ordinal))
            .is_some_and(|l| l.handle_state().is_some());
        if !is_handle {
            return Err(Fault::invalid_operation(format!("'{name}' is not a handle")));
        }
        Ok(location)
    }

    fn handle_state_mut(&mut self, location: LocationRef) -> Option<&mut HandleState> {
        self.executor
            .environments
            .get_mut(location.environment)
            .and_then(|e| e.get_mut(location.ordinal))
            .and_then(|l| l.handle_state_mut())
    }

    /// Read an argument or variable visible to this instance.
    pub fn get_value(&self, name: &str) -> ActivityResult<Value> {
        let location = self.locate(name)?;
        let cell = self
            .executor
            .environments
            .get(location.environment)
            .and_then(|e| e.get(location.ordinal))
            .ok_or_else(|| Fault::invalid_operation(format!("'{name}' has no storage")))?;
        if cell.handle_state().is_some() {
            return Err(Fault::invalid_operation(format!("'{name}' is a handle and has no value")).into());
        }
        Ok(cell.value.clone())
    }

    pub fn set_value(&mut self, name: &str, value: Value) -> ActivityResult {
        let location = self.locate(name)?;
        let cell = self
            .executor
            .environments
            .get_mut(location.environment)
            .and_then(|e| e.get_mut(location.ordinal))
            .ok_or_else(|| Fault::invalid_operation(format!("'{name}' has no storage")))?;
        if cell.handle_state().is_some() {
            return Err(Fault::invalid_operation(format!("'{name}' is a handle and cannot be assigned")).into());
        }
        cell.value = value;
        Ok(())
    }

    /// Read one of this activity's own arguments.
    pub fn get_argument(&self, name: &str) -> ActivityResult<Value> {
        let ordinal = self.argument_ordinal(name)?;
        let instance = self.executor.instances.get(self.instance);
        let value = instance
            .and_then(|i| i.environment)
            .and_then(|e| self.executor.environments.get(e))
            .and_then(|e| e.get(ordinal))
            .map(|l| l.value.clone())
            .unwrap_or(Value::Null);
        Ok(value)
    }

    /// Assign one of this activity's own arguments; out and in-out arguments
    /// are copied back to their bound variable on successful completion.
    pub fn set_argument(&mut self, name: &str, value: Value) -> ActivityResult {
        let ordinal = self.argument_ordinal(name)?;
        let env = self.executor.instances.get(self.instance).and_then(|i| i.environment);
        if let Some(cell) = env
            .and_then(|e| self.executor.environments.get_mut(e))
            .and_then(|e| e.get_mut(ordinal))
        {
            cell.value = value;
        }
        Ok(())
    }

    fn argument_ordinal(&self, name: &str) -> Result<usize, Fault> {
        self.node()
            .ok()
            .and_then(|n| n.layout.argument_ordinal(name))
            .ok_or_else(|| {
                Fault::new(
                    "InvalidArgument",
                    format!("{} declares no argument '{name}'", self.display_name()),
                )
            })
    }

    /// Value reported to the parent's completion callback and written to the
    /// argument this instance evaluates, if any.
    pub fn set_result(&mut self, value: Value) {
        if let Some(instance) = self.executor.instances.get_mut(self.instance) {
            instance.result = Some(value);
        }
    }

    // ----- children -----

    pub fn child_count(&self) -> usize {
        self.node().map_or(0, |n| n.children.len())
    }

    pub fn delegate_count(&self) -> usize {
        self.node().map_or(0, |n| n.delegates.len())
    }

    /// Schedule the declared child at `index`. It runs before work already
    /// queued.
    pub fn schedule_child(
        &mut self,
        index: usize,
        on_completed: Option<&str>,
        on_faulted: Option<&str>,
    ) -> ActivityResult<InstanceId> {
        let child = self.node()?.children.get(index).copied().ok_or_else(|| {
            WorkflowError::invalid_argument(format!("{} has no child {index}", self.display_name()))
        })?;
        let id = self.executor.schedule_child_instance(
            self.instance,
            child,
            ChildOptions {
                child_index: Some(index),
                on_completed,
                on_faulted,
                delegate_arguments: None,
            },
        )?;
        Ok(id)
    }

    /// Invoke the delegate at `index` with one value per declared parameter.
    pub fn schedule_delegate(
        &mut self,
        index: usize,
        arguments: Vec<Value>,
        on_completed: Option<&str>,
        on_faulted: Option<&str>,
    ) -> ActivityResult<InstanceId> {
        let handler = self.node()?.delegates.get(index).copied().ok_or_else(|| {
            WorkflowError::invalid_argument(format!("{} has no delegate {index}", self.display_name()))
        })?;
        let id = self.executor.schedule_child_instance(
            self.instance,
            handler,
            ChildOptions {
                child_index: Some(index),
                on_completed,
                on_faulted,
                delegate_arguments: Some(arguments),
            },
        )?;
        Ok(id)
    }

    /// Start the declared child at `index` as an independent root. It is not
    /// a child of this instance; the workflow completes only after it does.
    pub fn schedule_secondary_root(&mut self, index: usize) -> ActivityResult<InstanceId> {
        let child = self.node()?.children.get(index).copied().ok_or_else(|| {
            WorkflowError::invalid_argument(format!("{} has no child {index}", self.display_name()))
        })?;
        Ok(self.executor.schedule_secondary_root(self.instance, child)?)
    }

    /// Live children of this instance.
    pub fn children(&self) -> Vec<InstanceId> {
        self.executor
            .instances
            .get(self.instance)
            .map(|i| i.children.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn cancel_child(&mut self, child: InstanceId) -> ActivityResult {
        let is_child = self
            .executor
            .instances
            .get(self.instance)
            .is_some_and(|i| i.children.contains(&child));
        if !is_child {
            return Err(WorkflowError::invalid_operation(format!(
                "{child} is not a child of {}",
                self.instance
            ))
            .into());
        }
        self.executor.cancel_activity(child);
        Ok(())
    }

    pub fn cancel_children(&mut self) {
        for child in self.children() {
            self.executor.cancel_activity(child);
        }
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.executor
            .instances
            .get(self.instance)
            .is_some_and(|i| i.is_cancellation_requested)
    }

    /// Close as canceled rather than closed. Only valid once cancellation
    /// was requested.
    pub fn mark_canceled(&mut self) -> ActivityResult {
        let Some(instance) = self.executor.instances.get_mut(self.instance) else {
            return Ok(());
        };
        if !instance.is_cancellation_requested {
            return Err(WorkflowError::invalid_operation("cannot mark canceled before cancellation is requested").into());
        }
        instance.marked_canceled = true;
        Ok(())
    }

    /// Cancel children, drop bookmarks and close as canceled once the
    /// children are gone.
    pub fn perform_default_cancelation(&mut self) -> ActivityResult {
        if let Some(instance) = self.executor.instances.get_mut(self.instance) {
            instance.performing_default_cancelation = true;
        }
        self.remove_all_bookmarks();
        self.cancel_children();
        Ok(())
    }

    // ----- bookmarks -----

    fn check_can_induce_idle(&self, options: BookmarkOptions) -> Result<(), WorkflowError> {
        if options.non_blocking {
            return Ok(());
        }
        let allowed = self.node()?.activity().can_induce_idle();
        if allowed {
            Ok(())
        } else {
            Err(WorkflowError::invalid_operation(format!(
                "{} must opt into inducing idle to create blocking bookmarks",
                self.display_name()
            )))
        }
    }

    fn bookmark_created(&mut self, options: BookmarkOptions) {
        if !options.non_blocking
            && let Some(instance) = self.executor.instances.get_mut(self.instance)
        {
            instance.blocking_bookmark_count += 1;
        }
    }

    /// Create a bookmark. `None` creates an unnamed bookmark that only this
    /// instance can refer to.
    pub fn create_bookmark(
        &mut self,
        name: Option<&str>,
        callback: &str,
        options: BookmarkOptions,
    ) -> ActivityResult<Bookmark> {
        self.check_can_induce_idle(options)?;
        let bookmark = self.executor.bookmarks.create(self.instance, name, callback, options)?;
        self.bookmark_created(options);
        Ok(bookmark)
    }

    /// Create a named bookmark inside the correlation scope held by the
    /// bookmark-scope handle `scope_handle`.
    pub fn create_bookmark_in_scope(
        &mut self,
        scope_handle: &str,
        name: &str,
        callback: &str,
        options: BookmarkOptions,
    ) -> ActivityResult<Bookmark> {
        self.check_can_induce_idle(options)?;
        let location = self.handle_location(scope_handle)?;
        let scope = match self.handle_state_mut(location) {
            Some(HandleState::BookmarkScope { scope: Some(scope), .. }) => *scope,
            _ => {
                return Err(Fault::invalid_operation(format!(
                    "bookmark scope '{scope_handle}' is not initialized"
                ))
                .into());
            }
        };
        let bookmark = self
            .executor
            .scopes
            .scope_mut(scope)?
            .create(self.instance, Some(name), callback, options)?;
        self.bookmark_created(options);
        Ok(bookmark)
    }

    /// Bind the bookmark-scope handle `scope_handle` to a correlation id.
    pub fn initialize_bookmark_scope(&mut self, scope_handle: &str, scope: Uuid) -> ActivityResult {
        let location = self.handle_location(scope_handle)?;
        match self.handle_state_mut(location) {
            Some(HandleState::BookmarkScope { scope: current, .. }) => {
                if current.is_some() {
                    return Err(Fault::invalid_operation(format!(
                        "bookmark scope '{scope_handle}' is already initialized"
                    ))
                    .into());
                }
                *current = Some(scope);
            }
            _ => return Err(Fault::invalid_operation(format!("'{scope_handle}' is not a bookmark scope")).into()),
        }
        if let Err(e) = self.executor.scopes.initialize_scope(scope) {
            if let Some(HandleState::BookmarkScope { scope: current, .. }) = self.handle_state_mut(location) {
                *current = None;
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn remove_bookmark(&mut self, bookmark: &Bookmark) -> bool {
        let Some(record) = self.executor.bookmarks.remove(bookmark, self.instance) else {
            return false;
        };
        if !record.options.non_blocking
            && let Some(instance) = self.executor.instances.get_mut(self.instance)
        {
            instance.blocking_bookmark_count = instance.blocking_bookmark_count.saturating_sub(1);
        }
        true
    }

    pub fn remove_all_bookmarks(&mut self) {
        self.executor.remove_bookmarks_of(self.instance);
    }

    // ----- persistence -----

    /// Ask for the instance to be persisted; `callback` runs once it was.
    pub fn request_persist(&mut self, callback: &str) {
        self.executor.persistence_waiters.push_back(PersistenceWaiter {
            instance: self.instance,
            callback: callback.to_string(),
        });
        if let Some(instance) = self.executor.instances.get_mut(self.instance) {
            instance.increment_busy_count();
        }
    }

    /// Enter the no-persist zone held by the handle `handle`.
    pub fn enter_no_persist(&mut self, handle: &str) -> ActivityResult {
        let location = self.handle_location(handle)?;
        match self.handle_state_mut(location) {
            Some(HandleState::NoPersist { entered, .. }) if !*entered => *entered = true,
            Some(HandleState::NoPersist { .. }) => {
                return Err(Fault::invalid_operation(format!("no-persist zone '{handle}' is already entered")).into());
            }
            _ => return Err(Fault::invalid_operation(format!("'{handle}' is not a no-persist handle")).into()),
        }
        self.executor.enter_no_persist();
        Ok(())
    }

    pub fn exit_no_persist(&mut self, handle: &str) -> ActivityResult {
        let location = self.handle_location(handle)?;
        match self.handle_state_mut(location) {
            Some(HandleState::NoPersist { entered, .. }) if *entered => *entered = false,
            Some(HandleState::NoPersist { .. }) => {
                return Err(Fault::invalid_operation(format!("no-persist zone '{handle}' was not entered")).into());
            }
            _ => return Err(Fault::invalid_operation(format!("'{handle}' is not a no-persist handle")).into()),
        }
        self.executor.exit_no_persist();
        Ok(())
    }

    // ----- transactions -----

    /// Ask for `callback` to run with the transaction context available.
    /// With `requires` the request jumps the queue and the instance cannot
    /// persist while it waits.
    pub fn request_transaction_context(&mut self, callback: &str, requires: bool) {
        self.executor.request_transaction_context(self.instance, callback, requires);
    }

    /// Make `transaction` the ambient transaction with this instance as its
    /// isolation scope. Only valid from a transaction-context callback.
    pub fn set_runtime_transaction(
        &mut self,
        transaction: Arc<dyn Transaction>,
        abort_instance_on_failure: bool,
    ) -> ActivityResult {
        if !self.allow_transaction {
            return Err(WorkflowError::invalid_operation(
                "a runtime transaction can only be set from a transaction-context callback",
            )
            .into());
        }
        self.executor
            .set_runtime_transaction(self.instance, transaction, abort_instance_on_failure)
    }

    /// Request completion of the active transaction. `callback` runs once it
    /// committed.
    pub fn complete_transaction(&mut self, callback: Option<&str>) -> ActivityResult {
        Ok(self.executor.request_transaction_completion(self.instance, callback)?)
    }

    pub fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        crate::runtime::lock(&self.executor.runtime_transaction)
            .as_ref()
            .map(|data| crate::runtime::lock(data).original.clone())
    }

    pub fn is_isolation_scope(&self) -> bool {
        self.executor.isolation_scope() == Some(self.instance)
    }

    // ----- properties and extensions -----

    /// Nearest execution property named `name` registered on this instance or
    /// an ancestor.
    pub fn get_property(&self, name: &str) -> Option<Value> {
        find_property(&self.executor.instances, self.instance, name)
    }

    pub fn add_property(&mut self, name: &str, value: Value) {
        if let Some(instance) = self.executor.instances.get_mut(self.instance) {
            instance.properties.insert(name, value);
        }
    }

    pub fn add_thread_property(&mut self, name: &str, property: Arc<dyn WorkflowThreadProperty>) {
        if let Some(instance) = self.executor.instances.get_mut(self.instance) {
            instance.properties.add_thread_property(name, property);
        }
    }

    /// Host extension lookup. A failing host aborts the instance.
    pub fn get_extension<T: Any + Send + Sync>(&self) -> ActivityResult<Option<Arc<T>>> {
        let extension = self
            .executor
            .host
            .get_extension(std::any::TypeId::of::<T>())
            .map_err(ErrorDetails::from)?;
        Ok(extension.and_then(|e| e.downcast::<T>().ok()))
    }

    // ----- asynchronous work -----

    /// Hand `work` to the host. Its result is delivered to `callback` through
    /// [`crate::Activity::on_async_completed`]; meanwhile the instance stays
    /// busy and cannot persist.
    pub fn spawn_async(&mut self, callback: &str, work: AsyncWork) -> OperationId {
        let operation = self.begin_async_operation(callback);
        self.executor.host_requests.push(HostRequest::RunAsync { operation, work });
        operation
    }

    /// Register an outstanding operation that something outside the engine
    /// completes, typically through
    /// [`crate::runtime::WorkflowApplication::complete_operation`].
    pub fn begin_async_operation(&mut self, callback: &str) -> OperationId {
        let operation = self.executor.allocate_operation();
        self.executor.async_operations.insert(
            operation,
            AsyncOperationContext {
                id: operation,
                owner: self.instance,
                callback: callback.to_string(),
            },
        );
        if let Some(instance) = self.executor.instances.get_mut(self.instance) {
            instance.increment_busy_count();
        }
        self.executor.enter_no_persist();
        operation
    }

    // ----- misc -----

    /// Emit a custom tracking record.
    pub fn track(&mut self, name: &str, data: Value) {
        let activity = self.executor.activity_ref(self.instance);
        let name = name.to_string();
        self.executor.track(|record_number| TrackingRecord::Custom {
            record_number,
            activity,
            name,
            data,
        });
    }

    /// Abort the whole workflow instance at the end of this callback.
    pub fn abort_workflow(&mut self, reason: Fault) {
        self.executor.abort_workflow_instance(ErrorDetails::Application(reason));
    }

    /// Terminate the workflow instance once the scheduler idles.
    pub fn terminate_workflow(&mut self, reason: Fault) {
        self.executor.terminate(reason);
    }
}
