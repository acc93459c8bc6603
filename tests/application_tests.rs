mod common;

use common::{Observe, Recorder, Step};
use duroflow::activities::{ExternalOperation, InvokeAsync, Sequence, Throw, WaitForBookmark};
use duroflow::providers::fs::FsInstanceStore;
use duroflow::providers::in_memory::InMemoryInstanceStore;
use duroflow::providers::InstanceStore;
use duroflow::runtime::application::{
    PersistableIdleAction, RuntimeOptions, UnhandledExceptionAction, WorkflowApplication, WorkflowStatus,
};
use duroflow::runtime::observability::ObservabilityConfig;
use duroflow::runtime::transaction::{EnlistmentNotification, LocalTransaction, Transaction, TransactionStatus};
use duroflow::runtime::{ActivityInstanceState, BookmarkResumptionResult, Extensions, SynchronizationContext};
use duroflow::{
    Activity, ActivityContext, ActivityResult, ArgumentBinding, Fault, OperationId, Variable, WorkflowError,
    WorkflowIdentity,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn order_workflow() -> Arc<dyn Activity> {
    Arc::new(
        Sequence::new("Order")
            .with_variable(Variable::new("payment", json!(null)))
            .then(Step("received"))
            .then(WaitForBookmark::new("AwaitPayment", "payment").store_in("payment"))
            .then(Observe("payment")),
    )
}

fn app_with(
    definition: Arc<dyn Activity>,
    store: Arc<dyn InstanceStore>,
    options: RuntimeOptions,
) -> (WorkflowApplication, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let app = WorkflowApplication::builder(definition, WorkflowIdentity::new("order"), store)
        .options(options)
        .extensions(Extensions::new().with_tracking_participant(recorder.clone()))
        .build()
        .unwrap();
    (app, recorder)
}

/// A transaction whose outcome the host decides; the engine only waits.
struct HostOwned(Arc<LocalTransaction>);

impl Transaction for HostOwned {
    fn id(&self) -> uuid::Uuid {
        self.0.id()
    }

    fn status(&self) -> TransactionStatus {
        self.0.status()
    }

    fn enlist_volatile(&self, enlistment: Arc<dyn EnlistmentNotification>) -> Result<(), Fault> {
        self.0.enlist_volatile(enlistment)
    }

    fn is_committable(&self) -> bool {
        false
    }

    fn commit(&self) -> Result<(), Fault> {
        self.0.commit()
    }

    fn rollback(&self, reason: &str) {
        self.0.rollback(reason)
    }
}

/// Runs under a host-owned transaction and completes once it commits.
struct HostOwnedScope(Arc<LocalTransaction>);

impl Activity for HostOwnedScope {
    fn display_name(&self) -> &str {
        "HostOwnedScope"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.request_transaction_context("context", false);
        Ok(())
    }

    fn on_transaction_context(&self, ctx: &mut ActivityContext<'_>, _callback: &str) -> ActivityResult {
        ctx.set_runtime_transaction(Arc::new(HostOwned(self.0.clone())), true)?;
        ctx.complete_transaction(Some("committed"))
    }

    fn on_continuation(&self, ctx: &mut ActivityContext<'_>, _callback: &str) -> ActivityResult {
        ctx.track("committed", json!(true));
        Ok(())
    }
}

tokio::task_local! {
    static POSTED: bool;
}

/// Spawns posted work on tokio, marking it and counting operations.
#[derive(Default)]
struct CountingContext {
    posts: AtomicUsize,
    started: AtomicUsize,
    completed: AtomicUsize,
}

impl SynchronizationContext for CountingContext {
    fn post(&self, work: BoxFuture<'static, ()>) {
        self.posts.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(POSTED.scope(true, work));
    }

    fn operation_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn operation_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn outstanding_operations(&self) -> usize {
        self.started.load(Ordering::SeqCst) - self.completed.load(Ordering::SeqCst)
    }
}

/// Records whether it executes inside posted work.
struct WhereAmI;

impl Activity for WhereAmI {
    fn display_name(&self) -> &str {
        "WhereAmI"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let posted = POSTED.try_with(|p| *p).unwrap_or(false);
        ctx.track("posted", json!(posted));
        Ok(())
    }
}

fn completed_state(status: &WorkflowStatus) -> Option<ActivityInstanceState> {
    match status {
        WorkflowStatus::Completed { state, .. } => Some(*state),
        _ => None,
    }
}

#[tokio::test]
async fn runs_to_idle_and_completes_on_resume() {
    let (app, recorder) = app_with(
        order_workflow(),
        Arc::new(InMemoryInstanceStore::default()),
        RuntimeOptions::default(),
    );
    assert_eq!(app.status(), WorkflowStatus::NotStarted);
    app.start(BTreeMap::new()).await.unwrap();
    assert_eq!(app.wait_for_idle(WAIT).await.unwrap(), WorkflowStatus::Idle);

    let result = app.resume_bookmark("payment", json!(99)).await.unwrap();
    assert_eq!(result, BookmarkResumptionResult::Success);
    let status = app.wait_for_completion(WAIT).await.unwrap();
    assert_eq!(completed_state(&status), Some(ActivityInstanceState::Closed));
    assert_eq!(recorder.custom("observed"), vec![json!(99)]);
}

#[tokio::test]
async fn unload_on_idle_and_reload_on_resume() {
    let store = Arc::new(InMemoryInstanceStore::default());
    let options = RuntimeOptions {
        persistable_idle_action: PersistableIdleAction::Unload,
        ..Default::default()
    };
    let (app, recorder) = app_with(order_workflow(), store.clone(), options);
    app.run().await.unwrap();
    assert_eq!(app.wait_for_idle(WAIT).await.unwrap(), WorkflowStatus::Unloaded);
    assert_eq!(store.instance_count().await, 1);
    assert!(app.inspect(|_| ()).await.is_none());

    app.resume_bookmark("payment", json!("paid")).await.unwrap();
    let status = app.wait_for_completion(WAIT).await.unwrap();
    assert_eq!(completed_state(&status), Some(ActivityInstanceState::Closed));
    assert_eq!(recorder.custom("observed"), vec![json!("paid")]);
    assert_eq!(recorder.custom("step"), vec![json!("received")]);

    let saved = store.load(app.instance_id()).await.unwrap().unwrap();
    assert!(saved.is_completed());
}

#[tokio::test]
async fn persisted_instance_loads_into_a_new_application() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn InstanceStore> = Arc::new(FsInstanceStore::new(dir.path(), false));
    let options = RuntimeOptions {
        persistable_idle_action: PersistableIdleAction::Persist,
        ..Default::default()
    };
    let (first, _) = app_with(order_workflow(), store.clone(), options.clone());
    first.start(BTreeMap::new()).await.unwrap();
    first.wait_for_idle(WAIT).await.unwrap();
    let id = first.instance_id();
    drop(first);

    let recorder = Arc::new(Recorder::default());
    let second = WorkflowApplication::builder(order_workflow(), WorkflowIdentity::new("order"), store)
        .options(options)
        .extensions(Extensions::new().with_tracking_participant(recorder.clone()))
        .load(id)
        .await
        .unwrap();
    assert_eq!(second.instance_id(), id);
    assert_eq!(second.status(), WorkflowStatus::Idle);
    second.resume_bookmark("payment", json!(1)).await.unwrap();
    second.wait_for_completion(WAIT).await.unwrap();
    assert_eq!(recorder.custom("observed"), vec![json!(1)]);
}

#[tokio::test]
async fn loading_an_unknown_instance_fails() {
    let err = WorkflowApplication::builder(
        order_workflow(),
        WorkflowIdentity::new("order"),
        Arc::new(InMemoryInstanceStore::default()),
    )
    .load(uuid::Uuid::new_v4())
    .await
    .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidArgument(_)));
}

#[tokio::test]
async fn asynchronous_work_completes_the_activity() {
    let workflow = Sequence::new("Main")
        .with_variable(Variable::new("doubled", json!(null)))
        .then(
            InvokeAsync::new("Double", |input| {
                async move { Ok::<_, Fault>(json!(input.as_i64().unwrap_or(0) * 2)) }.boxed()
            })
            .with_input(ArgumentBinding::Literal(json!(21)))
            .store_in("doubled"),
        )
        .then(Observe("doubled"));
    let (app, recorder) = app_with(
        Arc::new(workflow),
        Arc::new(InMemoryInstanceStore::default()),
        RuntimeOptions::default(),
    );
    app.start(BTreeMap::new()).await.unwrap();
    let status = app.wait_for_completion(WAIT).await.unwrap();
    assert_eq!(completed_state(&status), Some(ActivityInstanceState::Closed));
    assert_eq!(recorder.custom("observed"), vec![json!(42)]);
}

#[tokio::test]
async fn external_operation_is_completed_by_the_caller() {
    let workflow = Sequence::new("Main")
        .with_variable(Variable::new("reply", json!(null)))
        .then(ExternalOperation::new("Callback").store_in("reply"))
        .then(Observe("reply"));
    let (app, recorder) = app_with(
        Arc::new(workflow),
        Arc::new(InMemoryInstanceStore::default()),
        RuntimeOptions::default(),
    );
    app.start(BTreeMap::new()).await.unwrap();
    assert_eq!(app.wait_for_idle(WAIT).await.unwrap(), WorkflowStatus::Idle);
    assert_eq!(app.inspect(|e| e.has_pending_operations()).await, Some(true));

    let operation = recorder.custom("operation")[0].as_u64().unwrap();
    app.complete_operation(OperationId(operation), Ok(json!("pong")))
        .await
        .unwrap();
    app.wait_for_completion(WAIT).await.unwrap();
    assert_eq!(recorder.custom("observed"), vec![json!("pong")]);
}

#[tokio::test]
async fn unhandled_fault_terminates_by_default() {
    let (app, _) = app_with(
        Arc::new(Sequence::new("Main").then(Throw::new("Boom", "nope"))),
        Arc::new(InMemoryInstanceStore::default()),
        RuntimeOptions::default(),
    );
    app.start(BTreeMap::new()).await.unwrap();
    match app.wait_for_completion(WAIT).await.unwrap() {
        WorkflowStatus::Completed { state, fault, .. } => {
            assert_eq!(state, ActivityInstanceState::Faulted);
            assert_eq!(fault.map(|f| f.kind), Some("Boom".to_string()));
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn abort_action_reports_cancellation_to_waiters() {
    let options = RuntimeOptions {
        unhandled_exception_action: UnhandledExceptionAction::Abort,
        ..Default::default()
    };
    let (app, _) = app_with(
        Arc::new(Sequence::new("Main").then(Throw::new("Boom", "nope"))),
        Arc::new(InMemoryInstanceStore::default()),
        options,
    );
    app.start(BTreeMap::new()).await.unwrap();
    let err = app.wait_for_completion(WAIT).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Canceled { .. }));
}

#[tokio::test]
async fn cancel_and_terminate_through_the_application() {
    let store = Arc::new(InMemoryInstanceStore::default());
    let (canceled, _) = app_with(order_workflow(), store.clone(), RuntimeOptions::default());
    canceled.start(BTreeMap::new()).await.unwrap();
    canceled.cancel().await.unwrap();
    let status = canceled.wait_for_completion(WAIT).await.unwrap();
    assert_eq!(completed_state(&status), Some(ActivityInstanceState::Canceled));

    let (terminated, _) = app_with(order_workflow(), store, RuntimeOptions::default());
    terminated.start(BTreeMap::new()).await.unwrap();
    terminated.terminate(Fault::new("Shutdown", "bye")).await.unwrap();
    let status = terminated.wait_for_completion(WAIT).await.unwrap();
    assert_eq!(completed_state(&status), Some(ActivityInstanceState::Faulted));
}

#[tokio::test]
async fn waiting_times_out() {
    let (app, _) = app_with(
        order_workflow(),
        Arc::new(InMemoryInstanceStore::default()),
        RuntimeOptions::default(),
    );
    app.start(BTreeMap::new()).await.unwrap();
    let err = app
        .wait_for_completion(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Timeout));
}

#[tokio::test]
async fn metrics_count_engine_activity() {
    let options = RuntimeOptions {
        persistable_idle_action: PersistableIdleAction::Persist,
        observability: ObservabilityConfig {
            metrics_enabled: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let (app, _) = app_with(order_workflow(), Arc::new(InMemoryInstanceStore::default()), options);
    app.start(BTreeMap::new()).await.unwrap();
    app.wait_for_idle(WAIT).await.unwrap();
    app.resume_bookmark("payment", json!(5)).await.unwrap();
    app.wait_for_completion(WAIT).await.unwrap();

    let metrics = app.metrics_snapshot().unwrap();
    assert!(metrics.work_items_executed > 0);
    assert_eq!(metrics.bookmarks_resumed, 1);
    assert_eq!(metrics.instances_completed, 1);
    assert!(metrics.persists >= 2);
}

#[tokio::test]
async fn host_owned_transaction_outcome_is_awaited() {
    let transaction = LocalTransaction::new();
    let (app, recorder) = app_with(
        Arc::new(HostOwnedScope(transaction.clone())),
        Arc::new(InMemoryInstanceStore::default()),
        RuntimeOptions::default(),
    );
    // the outcome arrives from a thread outside the runtime
    let committer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        transaction.commit()
    });
    app.start(BTreeMap::new()).await.unwrap();
    let status = app.wait_for_completion(WAIT).await.unwrap();
    assert!(committer.join().unwrap().is_ok());
    assert_eq!(completed_state(&status), Some(ActivityInstanceState::Closed));
    assert_eq!(recorder.custom("committed"), vec![json!(true)]);
}

#[tokio::test]
async fn executor_runs_inside_the_synchronization_context() {
    let sync = Arc::new(CountingContext::default());
    let recorder = Arc::new(Recorder::default());
    let app = WorkflowApplication::builder(
        Arc::new(WhereAmI),
        WorkflowIdentity::new("where"),
        Arc::new(InMemoryInstanceStore::default()),
    )
    .extensions(Extensions::new().with_tracking_participant(recorder.clone()))
    .synchronization_context(sync.clone())
    .build()
    .unwrap();

    app.start(BTreeMap::new()).await.unwrap();
    let status = app.wait_for_completion(WAIT).await.unwrap();
    assert_eq!(completed_state(&status), Some(ActivityInstanceState::Closed));
    assert_eq!(recorder.custom("posted"), vec![json!(true)]);
    assert!(sync.posts.load(Ordering::SeqCst) >= 1);
    assert_eq!(sync.outstanding_operations(), 0);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_store_hosts_an_instance() {
    use duroflow::providers::sqlite::SqliteInstanceStore;

    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("flows.db").display());
    let store = Arc::new(SqliteInstanceStore::new(&url).await.unwrap());
    let options = RuntimeOptions {
        persistable_idle_action: PersistableIdleAction::Unload,
        ..Default::default()
    };
    let (app, recorder) = app_with(order_workflow(), store.clone(), options);
    app.start(BTreeMap::new()).await.unwrap();
    assert_eq!(app.wait_for_idle(WAIT).await.unwrap(), WorkflowStatus::Unloaded);
    assert_eq!(store.list_instances().await.unwrap().len(), 1);

    app.resume_bookmark("payment", json!(true)).await.unwrap();
    app.wait_for_completion(WAIT).await.unwrap();
    assert_eq!(recorder.custom("observed"), vec![json!(true)]);
}
