//! Hosting one workflow instance on tokio.
//!
//! [`WorkflowApplication`] owns an [`ActivityExecutor`] and services the host
//! requests it records. Snapshots go to an [`InstanceStore`] (staged behind
//! the ambient transaction when there is one), transaction outcomes are
//! awaited on the blocking pool, and asynchronous activity work is posted to
//! a [`SynchronizationContext`]. Status changes are published on a `watch`
//! channel so callers can wait for idle or completion.
//!
//! One caller at a time drives the executor. Calls that arrive while another
//! caller is driving only leave a signal behind, which the active driver
//! picks up before it stops.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot, watch};
use uuid::Uuid;

use crate::activity::Activity;
use crate::errors::{ErrorDetails, Fault, WorkflowError};
use crate::ids::{InstanceId, OperationId};
use crate::providers::{InstanceStore, StagedOutcome, StagedSave};
use crate::runtime::async_operation::{
    AsyncWork, InlineSynchronizationContext, SynchronizationContext, TokioSynchronizationContext,
};
use crate::runtime::bookmarks::{Bookmark, BookmarkResumptionResult};
use crate::runtime::dynamic_update::DynamicUpdateMap;
use crate::runtime::executor::{ActivityExecutor, ExecutorSettings, HostRequest};
use crate::runtime::extensions::{ExceptionPersistence, Extensions};
use crate::runtime::instance::ActivityInstanceState;
use crate::runtime::observability::{MetricsSnapshot, ObservabilityConfig, ObservabilityHandle};
use crate::runtime::properties::ExecutionProperties;
use crate::runtime::scheduler::SchedulerOutcome;
use crate::runtime::tracking::WorkflowInstanceEvent;
use crate::runtime::lock;
use crate::{Value, WorkflowIdentity};

/// What the host does when a fault escapes every handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhandledExceptionAction {
    /// Complete the workflow as faulted with the fault as its exception
    #[default]
    Terminate,
    /// Cancel the root activity
    Cancel,
    /// Abort the instance without running cancellation
    Abort,
}

/// What the host does when the instance goes idle at a persistable point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistableIdleAction {
    #[default]
    None,
    Persist,
    /// Persist, then drop the in-memory executor
    Unload,
}

/// Configuration options for a [`WorkflowApplication`].
///
/// # Example
///
/// ```rust,no_run
/// # use duroflow::runtime::{PersistableIdleAction, RuntimeOptions};
/// # use std::time::Duration;
/// let options = RuntimeOptions {
///     transaction_completion_timeout: Duration::from_secs(5),
///     persistable_idle_action: PersistableIdleAction::Unload,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// How long to wait for a transaction outcome the engine cannot drive
    /// itself. Expiry rolls the transaction back.
    ///
    /// Default: 30 seconds
    pub transaction_completion_timeout: Duration,

    /// Default: [`UnhandledExceptionAction::Terminate`]
    pub unhandled_exception_action: UnhandledExceptionAction,

    /// Default: [`PersistableIdleAction::None`]
    pub persistable_idle_action: PersistableIdleAction,

    /// Whether state may be persisted while a fault propagates.
    ///
    /// Default: true
    pub persist_exceptions: bool,

    /// Persist pending persistence requests inside a transaction before
    /// committing it.
    ///
    /// Default: true
    pub persist_before_commit: bool,

    /// Emit logs from activity code through the `activity_*!` macros.
    ///
    /// Default: true
    pub activity_logging: bool,

    pub observability: ObservabilityConfig,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let settings = ExecutorSettings::default();
        Self {
            transaction_completion_timeout: settings.transaction_completion_timeout,
            unhandled_exception_action: UnhandledExceptionAction::default(),
            persistable_idle_action: PersistableIdleAction::default(),
            persist_exceptions: true,
            persist_before_commit: settings.persist_before_commit,
            activity_logging: settings.activity_logging,
            observability: ObservabilityConfig::default(),
        }
    }
}

impl RuntimeOptions {
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            transaction_completion_timeout: self.transaction_completion_timeout,
            persist_before_commit: self.persist_before_commit,
            activity_logging: self.activity_logging,
        }
    }
}

/// Host-level view of the instance.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowStatus {
    NotStarted,
    Running,
    /// Waiting for a bookmark or an externally completed operation
    Idle,
    Paused,
    Completed {
        state: ActivityInstanceState,
        outputs: BTreeMap<String, Value>,
        fault: Option<Fault>,
    },
    Aborted {
        reason: ErrorDetails,
    },
    /// Persisted and removed from memory; the next call loads it again
    Unloaded,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed { .. } | WorkflowStatus::Aborted { .. })
    }

    fn is_settled(&self) -> bool {
        self.is_terminal()
            || matches!(
                self,
                WorkflowStatus::Idle | WorkflowStatus::Paused | WorkflowStatus::Unloaded
            )
    }
}

struct AppState {
    executor: Option<ActivityExecutor>,
    definition: Arc<dyn Activity>,
    identity: WorkflowIdentity,
    /// Saves waiting for their transaction to finish
    staged: Vec<StagedSave>,
}

struct Inner {
    instance_id: Uuid,
    store: Arc<dyn InstanceStore>,
    host: Arc<Extensions>,
    sync: Arc<dyn SynchronizationContext>,
    options: RuntimeOptions,
    observability: ObservabilityHandle,
    state: Mutex<AppState>,
    status: watch::Sender<WorkflowStatus>,
    driving: AtomicBool,
    /// Posted asynchronous work that has not reported back yet
    outstanding: AtomicUsize,
    /// The executor has something to run
    dirty: AtomicBool,
    completions: std::sync::Mutex<VecDeque<(OperationId, Result<Value, Fault>)>>,
}

/// A single workflow instance hosted on tokio.
#[derive(Clone)]
pub struct WorkflowApplication {
    inner: Arc<Inner>,
}

/// Builder for [`WorkflowApplication`].
pub struct WorkflowApplicationBuilder {
    definition: Arc<dyn Activity>,
    identity: WorkflowIdentity,
    store: Arc<dyn InstanceStore>,
    options: RuntimeOptions,
    extensions: Extensions,
    sync: Option<Arc<dyn SynchronizationContext>>,
    instance_id: Option<Uuid>,
}

impl WorkflowApplicationBuilder {
    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Where the executor and asynchronous activity work run. Defaults to the
    /// current tokio runtime, or inline execution outside one.
    pub fn synchronization_context(mut self, sync: Arc<dyn SynchronizationContext>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn instance_id(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    fn assemble(mut self, executor: Option<ActivityExecutor>, instance_id: Uuid) -> WorkflowApplication {
        let sync = self.sync.take().unwrap_or_else(|| match tokio::runtime::Handle::try_current() {
            Ok(handle) => Arc::new(TokioSynchronizationContext::new(handle)),
            Err(_) => Arc::new(InlineSynchronizationContext::default()),
        });
        let observability = ObservabilityHandle::init(&self.options.observability);
        let executor = executor.map(|e| e.with_metrics(observability.metrics_provider().clone()));
        let (status, _) = watch::channel(WorkflowStatus::NotStarted);
        WorkflowApplication {
            inner: Arc::new(Inner {
                instance_id,
                store: self.store,
                host: Arc::new(self.extensions),
                sync,
                options: self.options,
                observability,
                state: Mutex::new(AppState {
                    executor,
                    definition: self.definition,
                    identity: self.identity,
                    staged: Vec::new(),
                }),
                status,
                driving: AtomicBool::new(false),
                outstanding: AtomicUsize::new(0),
                dirty: AtomicBool::new(false),
                completions: std::sync::Mutex::new(VecDeque::new()),
            }),
        }
    }

    fn prepare_extensions(&mut self) {
        if self.extensions.get::<ExceptionPersistence>().is_none() {
            self.extensions.insert(Arc::new(ExceptionPersistence {
                persist_exceptions: self.options.persist_exceptions,
            }));
        }
    }

    /// Create an application for a new instance.
    pub fn build(mut self) -> Result<WorkflowApplication, WorkflowError> {
        self.prepare_extensions();
        let instance_id = self.instance_id.unwrap_or_else(Uuid::new_v4);
        let host = Arc::new(self.extensions.clone());
        let executor = ActivityExecutor::new(
            self.definition.clone(),
            self.identity.clone(),
            host,
            self.options.executor_settings(),
        )?
        .with_instance_id(instance_id);
        Ok(self.assemble(Some(executor), instance_id))
    }

    /// Create an application for an instance persisted in the store.
    pub async fn load(mut self, instance_id: Uuid) -> Result<WorkflowApplication, WorkflowError> {
        self.prepare_extensions();
        let app = self.assemble(None, instance_id);
        app.load().await?;
        Ok(app)
    }
}

struct DriveGuard<'a>(&'a AtomicBool);

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn unloaded(instance_id: Uuid) -> WorkflowError {
    WorkflowError::invalid_operation(format!("workflow {instance_id} is not loaded"))
}

impl WorkflowApplication {
    pub fn builder(
        definition: Arc<dyn Activity>,
        identity: WorkflowIdentity,
        store: Arc<dyn InstanceStore>,
    ) -> WorkflowApplicationBuilder {
        WorkflowApplicationBuilder {
            definition,
            identity,
            store,
            options: RuntimeOptions::default(),
            extensions: Extensions::new(),
            sync: None,
            instance_id: None,
        }
    }

    pub fn new(
        definition: Arc<dyn Activity>,
        identity: WorkflowIdentity,
        store: Arc<dyn InstanceStore>,
        options: RuntimeOptions,
    ) -> Result<Self, WorkflowError> {
        Self::builder(definition, identity, store).options(options).build()
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    pub fn status(&self) -> WorkflowStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowStatus> {
        self.inner.status.subscribe()
    }

    /// Counters, or `None` when metrics are disabled.
    pub fn metrics_snapshot(&self) -> Option<MetricsSnapshot> {
        self.inner.observability.metrics_snapshot()
    }

    /// Schedule the root with `inputs` and run until the instance settles.
    pub async fn start(&self, inputs: BTreeMap<String, Value>) -> Result<(), WorkflowError> {
        {
            let mut state = self.inner.state.lock().await;
            let executor = state
                .executor
                .as_mut()
                .ok_or_else(|| unloaded(self.inner.instance_id))?;
            executor.schedule_root_activity(inputs, ExecutionProperties::new())?;
            tracing::info!(
                target: "duroflow::runtime",
                instance_id = %self.inner.instance_id,
                workflow = %state.identity,
                "workflow started"
            );
        }
        self.signal();
        self.drive().await
    }

    /// Start the instance if it was never started, otherwise resume running
    /// whatever work is pending.
    pub async fn run(&self) -> Result<(), WorkflowError> {
        let needs_start = {
            let mut state = self.inner.state.lock().await;
            self.ensure_loaded(&mut state).await?;
            state.executor.as_ref().is_some_and(|e| e.root_instance().is_none())
        };
        if needs_start {
            return self.start(BTreeMap::new()).await;
        }
        self.signal();
        self.drive().await
    }

    pub async fn resume_bookmark(&self, name: &str, value: Value) -> Result<BookmarkResumptionResult, WorkflowError> {
        self.resume(None, name, value).await
    }

    /// Resume a bookmark registered inside the correlation scope `scope`.
    pub async fn resume_bookmark_in_scope(
        &self,
        scope: Uuid,
        name: &str,
        value: Value,
    ) -> Result<BookmarkResumptionResult, WorkflowError> {
        self.resume(Some(scope), name, value).await
    }

    async fn resume(&self, scope: Option<Uuid>, name: &str, value: Value) -> Result<BookmarkResumptionResult, WorkflowError> {
        let result = {
            let mut state = self.inner.state.lock().await;
            self.ensure_loaded(&mut state).await?;
            let executor = state
                .executor
                .as_mut()
                .ok_or_else(|| unloaded(self.inner.instance_id))?;
            let bookmark = Bookmark::named(name);
            match scope {
                Some(scope) => executor.try_resume_bookmark_in_scope(scope, &bookmark, value),
                None => executor.try_resume_bookmark(&bookmark, value),
            }
        };
        tracing::debug!(
            target: "duroflow::runtime",
            instance_id = %self.inner.instance_id,
            bookmark = name,
            result = ?result,
            "bookmark resumption"
        );
        if result == BookmarkResumptionResult::Success {
            self.signal();
            self.drive().await?;
        }
        Ok(result)
    }

    /// Request cancellation of the root activity.
    pub async fn cancel(&self) -> Result<(), WorkflowError> {
        self.with_executor(|e| e.cancel_root_activity()).await?;
        self.signal();
        self.drive().await
    }

    /// Complete the instance as faulted with `reason`.
    pub async fn terminate(&self, reason: Fault) -> Result<(), WorkflowError> {
        self.with_executor(|e| e.terminate(reason)).await?;
        self.signal();
        self.drive().await
    }

    /// Abort the instance. Nothing is persisted.
    pub async fn abort(&self, reason: Fault) -> Result<(), WorkflowError> {
        self.with_executor(|e| e.abort_workflow_instance(ErrorDetails::Application(reason)))
            .await?;
        self.signal();
        self.drive().await
    }

    /// Deliver the result of an operation started with
    /// [`crate::ActivityContext::begin_async_operation`].
    pub async fn complete_operation(&self, operation: OperationId, result: Result<Value, Fault>) -> Result<(), WorkflowError> {
        lock(&self.inner.completions).push_back((operation, result));
        self.drive().await
    }

    /// Save the instance now. Only valid at a persistable point.
    pub async fn persist(&self) -> Result<(), WorkflowError> {
        let mut state = self.inner.state.lock().await;
        self.save(&mut state).await
    }

    /// Persist and drop the in-memory executor.
    pub async fn unload(&self) -> Result<(), WorkflowError> {
        let mut state = self.inner.state.lock().await;
        self.unload_locked(&mut state).await
    }

    /// Reload an unloaded instance from the store and run any work it
    /// persisted as pending.
    pub async fn load(&self) -> Result<(), WorkflowError> {
        {
            let mut state = self.inner.state.lock().await;
            self.ensure_loaded(&mut state).await?;
        }
        self.signal();
        self.drive().await
    }

    /// Apply a dynamic update. The instance must be quiescent.
    pub async fn update(
        &self,
        map: &DynamicUpdateMap,
        definition: Arc<dyn Activity>,
        identity: WorkflowIdentity,
    ) -> Result<(), WorkflowError> {
        let mut state = self.inner.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let executor = state
            .executor
            .as_mut()
            .ok_or_else(|| unloaded(self.inner.instance_id))?;
        executor.update_instance(map, definition.clone(), identity.clone())?;
        state.definition = definition;
        state.identity = identity;
        Ok(())
    }

    /// Read the live executor, if loaded.
    pub async fn inspect<R>(&self, f: impl FnOnce(&ActivityExecutor) -> R) -> Option<R> {
        let state = self.inner.state.lock().await;
        state.executor.as_ref().map(f)
    }

    /// Wait until the instance completes. An aborted instance reports
    /// [`WorkflowError::Canceled`].
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<WorkflowStatus, WorkflowError> {
        let status = self.wait_for(timeout, WorkflowStatus::is_terminal).await?;
        match status {
            WorkflowStatus::Aborted { reason } => Err(WorkflowError::Canceled { reason }),
            other => Ok(other),
        }
    }

    /// Wait until the instance is idle, paused, unloaded or finished.
    pub async fn wait_for_idle(&self, timeout: Duration) -> Result<WorkflowStatus, WorkflowError> {
        let status = self.wait_for(timeout, WorkflowStatus::is_settled).await?;
        match status {
            WorkflowStatus::Aborted { reason } => Err(WorkflowError::Canceled { reason }),
            other => Ok(other),
        }
    }

    async fn wait_for(&self, timeout: Duration, done: fn(&WorkflowStatus) -> bool) -> Result<WorkflowStatus, WorkflowError> {
        let mut rx = self.inner.status.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| done(s))).await {
            Ok(Ok(status)) => Ok(status.clone()),
            Ok(Err(_)) => Err(WorkflowError::invalid_operation("workflow application was dropped")),
            Err(_) => Err(WorkflowError::Timeout),
        }
    }

    // ----- driving -----

    async fn with_executor(&self, f: impl FnOnce(&mut ActivityExecutor)) -> Result<(), WorkflowError> {
        let mut state = self.inner.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let executor = state
            .executor
            .as_mut()
            .ok_or_else(|| unloaded(self.inner.instance_id))?;
        f(executor);
        Ok(())
    }

    fn signal(&self) {
        self.inner.dirty.store(true, Ordering::Release);
        self.publish(WorkflowStatus::Running);
    }

    fn has_signal(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire) || !lock(&self.inner.completions).is_empty()
    }

    fn publish(&self, status: WorkflowStatus) {
        self.inner.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    /// Post a run of the executor to the synchronization context and wait
    /// for it to settle.
    fn drive(&self) -> BoxFuture<'static, Result<(), WorkflowError>> {
        let app = self.clone();
        let (done, settled) = oneshot::channel();
        self.inner.sync.operation_started();
        self.inner.sync.post(
            async move {
                let result = app.drive_posted().await;
                app.inner.sync.operation_completed();
                let _ = done.send(result);
            }
            .boxed(),
        );
        async move {
            settled
                .await
                .unwrap_or_else(|_| Err(WorkflowError::invalid_operation("synchronization context dropped the run")))
        }
        .boxed()
    }

    async fn drive_posted(&self) -> Result<(), WorkflowError> {
        loop {
            if self.inner.driving.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            let result = {
                let _guard = DriveGuard(&self.inner.driving);
                self.drive_until_settled().await
            };
            result?;
            // a signal may have landed between the last step and releasing the flag
            if !self.has_signal() {
                return Ok(());
            }
        }
    }

    async fn drive_until_settled(&self) -> Result<(), WorkflowError> {
        loop {
            let mut posted = Vec::new();
            let progressed = {
                let mut state = self.inner.state.lock().await;
                self.step(&mut state, &mut posted).await?
            };
            let posted_any = !posted.is_empty();
            for (operation, work) in posted {
                self.post(operation, work);
            }
            if !progressed && !posted_any && !self.has_signal() {
                return Ok(());
            }
        }
    }

    fn post(&self, operation: OperationId, work: AsyncWork) {
        let app = self.clone();
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        self.inner.sync.operation_started();
        self.inner.sync.post(
            async move {
                let result = work.await;
                lock(&app.inner.completions).push_back((operation, result));
                app.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
                app.inner.sync.operation_completed();
                if let Err(e) = app.drive().await {
                    tracing::error!(
                        target: "duroflow::runtime",
                        instance_id = %app.inner.instance_id,
                        operation = %operation,
                        error = %e,
                        "failed to deliver asynchronous completion"
                    );
                }
            }
            .boxed(),
        );
    }

    /// Run the executor once and service what it asked for. Returns false
    /// when there was nothing to do.
    async fn step(&self, state: &mut AppState, posted: &mut Vec<(OperationId, AsyncWork)>) -> Result<bool, WorkflowError> {
        let completions: Vec<_> = lock(&self.inner.completions).drain(..).collect();
        let AppState { executor, staged, .. } = state;
        let Some(executor) = executor.as_mut() else {
            if !completions.is_empty() {
                tracing::warn!(
                    target: "duroflow::runtime",
                    instance_id = %self.inner.instance_id,
                    count = completions.len(),
                    "dropping asynchronous completions for an unloaded instance"
                );
            }
            self.inner.dirty.store(false, Ordering::Release);
            return Ok(false);
        };
        for (operation, result) in completions {
            match executor.complete_async_operation(operation, result) {
                Ok(()) => self.inner.dirty.store(true, Ordering::Release),
                Err(e) => tracing::warn!(
                    target: "duroflow::runtime",
                    instance_id = %self.inner.instance_id,
                    operation = %operation,
                    error = %e,
                    "ignoring completion"
                ),
            }
        }
        if !self.inner.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let outcome = executor.run()?;
        let mut resumed = false;
        for request in executor.take_host_requests() {
            match request {
                HostRequest::Persist {
                    operation,
                    snapshot,
                    transaction,
                    associate_keys,
                    disassociate_keys,
                } => {
                    let result = match transaction {
                        Some(transaction) => {
                            StagedSave::stage(*snapshot, associate_keys, disassociate_keys, &transaction)
                                .map(|save| staged.push(save))
                        }
                        None => {
                            self.inner
                                .store
                                .save_with_keys(&snapshot, &associate_keys, &disassociate_keys)
                                .await
                        }
                    };
                    executor.complete_host_operation(operation, result.map_err(|e| e.to_infrastructure_error()))?;
                    resumed = true;
                }
                HostRequest::AwaitTransactionOutcome {
                    operation,
                    mut receiver,
                    timeout,
                } => {
                    let outcome = tokio::time::timeout(timeout, receiver.recv()).await.ok().flatten();
                    executor.complete_transaction_outcome(operation, outcome)?;
                    resumed = true;
                }
                HostRequest::RunAsync { operation, work } => posted.push((operation, work)),
            }
        }
        self.apply_staged(executor, staged).await;
        if resumed {
            self.inner.dirty.store(true, Ordering::Release);
        }

        let mut went_idle = false;
        match outcome {
            SchedulerOutcome::Pending => {}
            SchedulerOutcome::UnhandledException { fault, source } => {
                self.apply_unhandled_exception_action(executor, fault, source);
                self.inner.dirty.store(true, Ordering::Release);
            }
            SchedulerOutcome::Idle => {
                // operations completed through `complete_operation` do not keep
                // the instance from reporting idle; posted work does
                went_idle = !resumed
                    && posted.is_empty()
                    && self.inner.outstanding.load(Ordering::Acquire) == 0
                    && lock(&self.inner.completions).is_empty();
            }
            SchedulerOutcome::Paused => self.publish(WorkflowStatus::Paused),
            SchedulerOutcome::Completed(completed) => {
                self.publish(WorkflowStatus::Completed {
                    state: completed,
                    outputs: executor.workflow_outputs().clone(),
                    fault: executor.completion_exception().cloned(),
                });
                if self.inner.options.persistable_idle_action != PersistableIdleAction::None
                    && executor.is_persistable()
                {
                    self.save(state).await?;
                }
            }
            SchedulerOutcome::Aborted(reason) => self.publish(WorkflowStatus::Aborted { reason }),
        }
        if went_idle {
            self.on_idle(state).await?;
        }
        Ok(true)
    }

    async fn apply_staged(&self, executor: &mut ActivityExecutor, staged: &mut Vec<StagedSave>) {
        let mut pending = Vec::with_capacity(staged.len());
        for mut save in staged.drain(..) {
            match save.try_apply(&*self.inner.store).await {
                Ok(StagedOutcome::Pending) => pending.push(save),
                Ok(StagedOutcome::Applied) => {}
                Ok(StagedOutcome::Discarded) => tracing::debug!(
                    target: "duroflow::runtime",
                    instance_id = %self.inner.instance_id,
                    "discarding save of a rolled back transaction"
                ),
                Err(e) => {
                    tracing::error!(
                        target: "duroflow::runtime",
                        instance_id = %self.inner.instance_id,
                        error = %e,
                        "failed to write a committed save"
                    );
                    executor.abort_workflow_instance(e.to_infrastructure_error());
                    self.inner.dirty.store(true, Ordering::Release);
                }
            }
        }
        *staged = pending;
    }

    fn apply_unhandled_exception_action(&self, executor: &mut ActivityExecutor, fault: Fault, source: InstanceId) {
        let action = self.inner.options.unhandled_exception_action;
        tracing::info!(
            target: "duroflow::runtime",
            instance_id = %self.inner.instance_id,
            source = %source,
            action = ?action,
            "applying unhandled exception action"
        );
        match action {
            UnhandledExceptionAction::Terminate => executor.terminate(fault),
            UnhandledExceptionAction::Cancel => executor.cancel_root_activity(),
            UnhandledExceptionAction::Abort => executor.abort_workflow_instance(ErrorDetails::Application(fault)),
        }
    }

    async fn on_idle(&self, state: &mut AppState) -> Result<(), WorkflowError> {
        let persistable = state.executor.as_ref().is_some_and(|e| e.is_persistable());
        match self.inner.options.persistable_idle_action {
            PersistableIdleAction::Persist if persistable => self.save(state).await?,
            PersistableIdleAction::Unload if persistable => return self.unload_locked(state).await,
            _ => {}
        }
        self.publish(WorkflowStatus::Idle);
        Ok(())
    }

    async fn save(&self, state: &mut AppState) -> Result<(), WorkflowError> {
        let executor = state
            .executor
            .as_mut()
            .ok_or_else(|| unloaded(self.inner.instance_id))?;
        if !executor.is_persistable() {
            return Err(WorkflowError::invalid_operation(format!(
                "workflow {} is not at a persistable point",
                self.inner.instance_id
            )));
        }
        let (associate, disassociate) = executor.scopes.take_key_changes();
        let snapshot = executor.snapshot()?;
        self.inner
            .store
            .save_with_keys(&snapshot, &associate, &disassociate)
            .await?;
        if let Some(m) = &executor.metrics {
            m.record_persist();
        }
        executor.track_workflow(WorkflowInstanceEvent::Persisted);
        tracing::debug!(
            target: "duroflow::runtime",
            instance_id = %self.inner.instance_id,
            "workflow persisted"
        );
        Ok(())
    }

    async fn unload_locked(&self, state: &mut AppState) -> Result<(), WorkflowError> {
        if state.executor.is_none() {
            return Ok(());
        }
        self.save(state).await?;
        if let Some(mut executor) = state.executor.take() {
            executor.track_workflow(WorkflowInstanceEvent::Unloaded);
        }
        tracing::info!(
            target: "duroflow::runtime",
            instance_id = %self.inner.instance_id,
            "workflow unloaded"
        );
        self.publish(WorkflowStatus::Unloaded);
        Ok(())
    }

    async fn ensure_loaded(&self, state: &mut AppState) -> Result<(), WorkflowError> {
        if state.executor.is_some() {
            return Ok(());
        }
        let snapshot = self
            .inner
            .store
            .load(self.inner.instance_id)
            .await?
            .ok_or_else(|| {
                WorkflowError::invalid_argument(format!("no persisted instance {}", self.inner.instance_id))
            })?;
        let host: Arc<Extensions> = self.inner.host.clone();
        let executor = ActivityExecutor::restore(
            snapshot,
            state.definition.clone(),
            state.identity.clone(),
            host,
            self.inner.options.executor_settings(),
        )?
        .with_metrics(self.inner.observability.metrics_provider().clone());

        let status = match executor.execution_state() {
            Some(completed) => WorkflowStatus::Completed {
                state: completed,
                outputs: executor.workflow_outputs().clone(),
                fault: executor.completion_exception().cloned(),
            },
            None => WorkflowStatus::Idle,
        };
        tracing::info!(
            target: "duroflow::runtime",
            instance_id = %self.inner.instance_id,
            workflow = %state.identity,
            "workflow loaded"
        );
        state.executor = Some(executor);
        self.publish(status);
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowApplication")
            .field("instance_id", &self.inner.instance_id)
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}
