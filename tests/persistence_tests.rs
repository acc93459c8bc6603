mod common;

use common::{Observe, Recorder, Step, TestHost, closed};
use duroflow::activities::{NoPersistScope, Parallel, Persist, Sequence, WaitForBookmark};
use duroflow::runtime::{Extensions, SchedulerOutcome, WorkflowInstanceEvent, WorkflowSnapshot};
use duroflow::{Activity, ActivityExecutor, ErrorDetails, ExecutorSettings, Variable, WorkflowError, WorkflowIdentity};
use serde_json::json;
use std::sync::Arc;

fn waiting_workflow() -> Sequence {
    Sequence::new("Main")
        .with_variable(Variable::new("answer", json!(null)))
        .then(Step("before"))
        .then(WaitForBookmark::new("Wait", "answer").store_in("answer"))
        .then(Observe("answer"))
}

fn restore(snapshot: WorkflowSnapshot, root: impl Activity + 'static) -> Result<TestHost, WorkflowError> {
    let recorder = Arc::new(Recorder::default());
    let extensions = Extensions::new().with_tracking_participant(recorder.clone());
    let executor = ActivityExecutor::restore(
        snapshot,
        Arc::new(root),
        WorkflowIdentity::new("test"),
        Arc::new(extensions),
        ExecutorSettings::default(),
    )?;
    Ok(TestHost::from_executor(executor, recorder))
}

#[test]
fn idle_instance_survives_a_round_trip() {
    let mut host = TestHost::new(waiting_workflow());
    assert_eq!(host.start(), SchedulerOutcome::Idle);
    let bytes = host.executor.snapshot().unwrap().to_json().unwrap();
    drop(host);

    let snapshot = WorkflowSnapshot::from_json(&bytes).unwrap();
    assert!(!snapshot.is_completed());
    let mut restored = restore(snapshot, waiting_workflow()).unwrap();
    assert_eq!(restored.executor.bookmarks().len(), 1);
    assert_eq!(restored.resume_and_run("answer", json!(42)), closed());
    assert!(restored.recorder.custom("step").is_empty());
    assert_eq!(restored.recorder.custom("observed"), vec![json!(42)]);
}

#[test]
fn persist_activity_saves_a_resumable_snapshot() {
    let workflow = || {
        Sequence::new("Main")
            .then(Step("a"))
            .then(Persist::default())
            .then(Step("b"))
    };
    let mut host = TestHost::new(workflow());
    assert_eq!(host.start(), closed());
    assert_eq!(host.saved.len(), 1);
    assert!(host.recorder.workflow_events().contains(&WorkflowInstanceEvent::Persisted));

    // the saved state resumes right after the persist point
    let mut restored = restore(host.saved.remove(0), workflow()).unwrap();
    assert_eq!(restored.run(), closed());
    assert_eq!(restored.recorder.custom("step"), vec![json!("b")]);
}

#[test]
fn failed_persist_aborts_the_instance() {
    let mut host = TestHost::new(Sequence::new("Main").then(Persist::default()).then(Step("after")));
    host.fail_next_persist = Some(ErrorDetails::infrastructure("save", "disk full"));
    assert!(matches!(host.start(), SchedulerOutcome::Aborted(ErrorDetails::Infrastructure { .. })));
    assert!(host.saved.is_empty());
    assert!(host.recorder.custom("step").is_empty());
}

#[test]
fn restore_rejects_a_different_definition() {
    let mut host = TestHost::new(waiting_workflow());
    host.start();
    let snapshot = host.executor.snapshot().unwrap();

    let changed = Sequence::new("Main").then(WaitForBookmark::new("Wait", "answer"));
    let err = restore(snapshot, changed).err().expect("definition mismatch");
    assert!(matches!(err, WorkflowError::VersionMismatch { .. }));
}

#[test]
fn restore_rejects_a_different_identity() {
    let mut host = TestHost::new(waiting_workflow());
    host.start();
    let snapshot = host.executor.snapshot().unwrap();

    let err = ActivityExecutor::restore(
        snapshot,
        Arc::new(waiting_workflow()),
        WorkflowIdentity::new("test").with_version(semver::Version::new(2, 0, 0)),
        Arc::new(Extensions::new()),
        ExecutorSettings::default(),
    )
    .err()
    .expect("identity mismatch");
    assert!(matches!(err, WorkflowError::VersionMismatch { .. }));
}

#[test]
fn no_persist_zone_blocks_snapshots() {
    let mut host = TestHost::new(NoPersistScope::new("Zone", WaitForBookmark::new("Wait", "go")));
    assert_eq!(host.start(), SchedulerOutcome::Idle);
    assert_eq!(host.executor.no_persist_count(), 1);
    assert!(!host.executor.is_persistable());
    assert!(matches!(host.executor.snapshot(), Err(WorkflowError::InvalidOperation(_))));

    assert_eq!(host.resume_and_run("go", json!(null)), closed());
    assert_eq!(host.executor.no_persist_count(), 0);
}

#[test]
fn persist_request_waits_for_the_no_persist_zone() {
    let mut host = TestHost::new(
        Parallel::new("Fan")
            .branch(NoPersistScope::new("Zone", WaitForBookmark::new("Wait", "go")))
            .branch(Persist::default()),
    );
    assert_eq!(host.start(), SchedulerOutcome::Idle);
    assert!(host.saved.is_empty());
    assert_eq!(host.resume_and_run("go", json!(null)), closed());
    assert_eq!(host.saved.len(), 1);
}
