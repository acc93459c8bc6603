mod common;

use common::{Observe, Step, TestHost, closed};
use duroflow::activities::{Parallel, Persist, Sequence, Throw, TransactionScope, TryCatch, WaitForBookmark};
use duroflow::runtime::transaction::{EnlistmentNotification, LocalTransaction, PreparedVote};
use duroflow::runtime::{ActivityInstanceState, BookmarkResumptionResult, Extensions, SchedulerOutcome};
use duroflow::{Activity, ActivityContext, ActivityError, ActivityResult, ErrorDetails, ExecutorSettings, Fault};
use serde_json::json;
use std::sync::Arc;

/// Enlists a participant that votes to roll back.
struct Veto;

struct RollbackVote;

impl EnlistmentNotification for RollbackVote {
    fn prepare(&self) -> PreparedVote {
        PreparedVote::ForceRollback
    }

    fn commit(&self) {}

    fn rollback(&self) {}

    fn in_doubt(&self) {}
}

impl Activity for Veto {
    fn display_name(&self) -> &str {
        "Veto"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let transaction = ctx
            .current_transaction()
            .ok_or_else(|| Fault::new("NoTransaction", "veto needs an ambient transaction"))?;
        transaction.enlist_volatile(Arc::new(RollbackVote))?;
        Ok(())
    }
}

/// Sets the runtime transaction twice from its context callback.
struct DoubleSet;

impl Activity for DoubleSet {
    fn display_name(&self) -> &str {
        "DoubleSet"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.request_transaction_context("context", false);
        Ok(())
    }

    fn on_transaction_context(&self, ctx: &mut ActivityContext<'_>, _callback: &str) -> ActivityResult {
        ctx.set_runtime_transaction(LocalTransaction::new(), true)?;
        let kind = match ctx.set_runtime_transaction(LocalTransaction::new(), true) {
            Err(ActivityError::Fault(fault)) => fault.kind,
            Err(ActivityError::Abort(_)) => "abort".to_string(),
            Ok(()) => "accepted".to_string(),
        };
        ctx.track("second_set", json!(kind));
        ctx.complete_transaction(Some("committed"))
    }

    fn on_continuation(&self, _ctx: &mut ActivityContext<'_>, _callback: &str) -> ActivityResult {
        Ok(())
    }
}

fn complete_transaction_items(host: &TestHost) -> usize {
    host.recorder
        .work_items()
        .iter()
        .filter(|(kind, _)| kind == "CompleteTransaction")
        .count()
}

#[test]
fn scope_commits_once_its_body_is_done() {
    let mut host = TestHost::new(Sequence::new("Main").then(TransactionScope::new("Tx", Step("work"))));
    assert_eq!(host.start(), closed());
    assert_eq!(host.recorder.custom("step"), vec![json!("work")]);
    assert_eq!(host.recorder.state_of("Tx"), Some(ActivityInstanceState::Closed));
    assert_eq!(complete_transaction_items(&host), 1);
    assert!(!host.executor.has_active_transaction());
    assert_eq!(host.executor.no_persist_count(), 0);
}

#[test]
fn nested_scope_joins_the_ambient_transaction() {
    let mut host = TestHost::new(TransactionScope::new(
        "Outer",
        Sequence::new("Body")
            .then(TransactionScope::new("Inner", Step("inner")))
            .then(Step("outer")),
    ));
    assert_eq!(host.start(), closed());
    assert_eq!(host.recorder.custom("step"), vec![json!("inner"), json!("outer")]);
    assert_eq!(complete_transaction_items(&host), 1);
    assert_eq!(host.recorder.state_of("Inner"), Some(ActivityInstanceState::Closed));
}

#[test]
fn pending_persist_is_saved_before_commit() {
    let settings = ExecutorSettings {
        persist_before_commit: true,
        ..ExecutorSettings::default()
    };
    let mut host = TestHost::with_settings(
        Arc::new(
            Parallel::new("Fan")
                .branch(TransactionScope::new("Tx", Step("work")))
                .branch(Persist::default()),
        ),
        Extensions::new(),
        settings,
    );
    assert_eq!(host.start(), closed());
    assert_eq!(host.saved.len(), 1);
    assert!(!host.saved[0].is_completed());
    assert_eq!(host.recorder.state_of("Persist"), Some(ActivityInstanceState::Closed));
    assert_eq!(host.recorder.state_of("Tx"), Some(ActivityInstanceState::Closed));
}

#[test]
fn outside_bookmarks_wait_for_the_transaction() {
    let mut host = TestHost::new(
        Parallel::new("Fan")
            .branch(TransactionScope::new("Tx", WaitForBookmark::new("Inner", "inner")))
            .branch(WaitForBookmark::new("Outer", "outer")),
    );
    assert_eq!(host.start(), SchedulerOutcome::Idle);
    assert!(host.executor.has_active_transaction());
    assert!(!host.executor.is_persistable());

    assert_eq!(host.resume("outer", json!(1)), BookmarkResumptionResult::NotReady);
    assert_eq!(host.resume_and_run("inner", json!(2)), SchedulerOutcome::Idle);
    assert!(!host.executor.has_active_transaction());
    assert_eq!(host.resume_and_run("outer", json!(3)), closed());
}

#[test]
fn rolled_back_transaction_aborts_by_default() {
    let mut host = TestHost::new(TransactionScope::new("Tx", Veto));
    assert!(matches!(host.start(), SchedulerOutcome::Aborted(_)));
    assert!(host.executor.is_aborted());
    assert_eq!(host.executor.execution_state(), Some(ActivityInstanceState::Faulted));
}

#[test]
fn rolled_back_transaction_can_fault_instead() {
    let mut host = TestHost::new(TryCatch::new(
        "Guard",
        TransactionScope::new("Tx", Veto).fault_on_failure(),
        Observe("exception"),
    ));
    assert_eq!(host.start(), closed());
    let observed = host.recorder.custom("observed");
    assert_eq!(observed[0]["kind"], json!("TransactionAborted"));
    assert_eq!(host.recorder.state_of("Tx"), Some(ActivityInstanceState::Faulted));
}

#[test]
fn body_fault_is_rethrown_to_the_enclosing_handler() {
    let mut host = TestHost::new(TryCatch::new(
        "Guard",
        TransactionScope::new("Tx", Throw::new("Boom", "bad")).fault_on_failure(),
        Observe("exception"),
    ));
    assert_eq!(host.start(), closed());
    let observed = host.recorder.custom("observed");
    assert_eq!(observed[0]["kind"], json!("Boom"));
    assert_eq!(host.recorder.state_of("Tx"), Some(ActivityInstanceState::Faulted));
    assert!(!host.executor.has_active_transaction());
}

#[test]
fn body_fault_aborts_the_instance_by_default() {
    let mut host = TestHost::new(TransactionScope::new("Tx", Throw::new("Boom", "bad")));
    match host.start() {
        SchedulerOutcome::Aborted(ErrorDetails::Application(fault)) => {
            assert_eq!(fault.kind, "TransactionAborted");
            assert_eq!(fault.inner.map(|inner| inner.kind), Some("Boom".to_string()));
        }
        other => panic!("expected an abort, got {other:?}"),
    }
    assert!(host.executor.is_aborted());
}

#[test]
fn root_cancel_waits_for_the_isolation_scope() {
    let mut host = TestHost::new(
        Sequence::new("Main")
            .then(TransactionScope::new("Tx", WaitForBookmark::new("Inner", "inner")))
            .then(Step("after")),
    );
    assert_eq!(host.start(), SchedulerOutcome::Idle);

    host.executor.cancel_root_activity();
    assert_eq!(host.run(), SchedulerOutcome::Idle);
    assert!(host.executor.has_active_transaction());
    assert_eq!(host.recorder.state_of("Main"), None);

    assert_eq!(
        host.resume_and_run("inner", json!(1)),
        SchedulerOutcome::Completed(ActivityInstanceState::Canceled)
    );
    assert!(!host.executor.has_active_transaction());
    assert!(host.recorder.custom("step").is_empty());
}

#[test]
fn only_one_runtime_transaction_can_be_active() {
    let mut host = TestHost::new(DoubleSet);
    assert_eq!(host.start(), closed());
    assert_eq!(host.recorder.custom("second_set"), vec![json!("InvalidOperation")]);
    assert_eq!(complete_transaction_items(&host), 1);
    assert!(!host.executor.has_active_transaction());
}
