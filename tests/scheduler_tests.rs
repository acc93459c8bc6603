mod common;

use common::{Observe, Step, TestHost, closed};
use duroflow::activities::{Assign, Literal, Parallel, ScheduleSecondaryRoot, Sequence, WaitForBookmark};
use duroflow::runtime::{ActivityInstanceState, SchedulerOutcome, WorkflowInstanceEvent};
use duroflow::{Variable, WorkflowError};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

#[test]
fn sequence_runs_children_in_order() {
    let mut host = TestHost::new(Sequence::new("Main").then(Step("a")).then(Step("b")));
    assert_eq!(host.start(), closed());
    assert_eq!(host.recorder.custom("step"), vec![json!("a"), json!("b")]);
    assert_eq!(host.recorder.state_of("Main"), Some(ActivityInstanceState::Closed));
    assert_eq!(host.executor.execution_state(), Some(ActivityInstanceState::Closed));
}

#[test]
fn empty_sequence_closes_immediately() {
    let mut host = TestHost::new(Sequence::new("Empty"));
    assert_eq!(host.start(), closed());
    assert_eq!(
        host.recorder.workflow_events().last(),
        Some(&WorkflowInstanceEvent::Completed)
    );
}

#[test]
fn parallel_starts_branches_in_declaration_order() {
    let mut host = TestHost::new(
        Parallel::new("Fan")
            .branch(Step("a"))
            .branch(Step("b"))
            .branch(Step("c")),
    );
    assert_eq!(host.start(), closed());
    assert_eq!(host.recorder.custom("step"), vec![json!("a"), json!("b"), json!("c")]);
}

#[test]
fn assign_evaluates_expression_into_variable() {
    let mut host = TestHost::new(
        Sequence::new("Main")
            .with_variable(Variable::new("x", json!(0)))
            .then(Assign::expression("x", Arc::new(Literal::new(json!(5)))))
            .then(Observe("x"))
            .then(Assign::literal("x", json!("seven")))
            .then(Observe("x")),
    );
    assert_eq!(host.start(), closed());
    assert_eq!(host.recorder.custom("observed"), vec![json!(5), json!("seven")]);
}

#[test]
fn argument_expression_runs_before_the_activity() {
    let mut host = TestHost::new(
        Sequence::new("Main")
            .with_variable(Variable::new("x", json!(null)))
            .then(Assign::expression("x", Arc::new(Literal::new(json!(1))))),
    );
    host.start();
    let items = host.recorder.work_items();
    let expression = items.iter().position(|(kind, _)| kind == "ExecuteExpression");
    let assign = items
        .iter()
        .position(|(kind, name)| kind == "ExecuteActivity" && name == "Assign");
    assert!(expression.is_some() && assign.is_some());
    assert!(expression < assign);
}

#[test]
fn idle_while_waiting_then_completes_on_resume() {
    let mut host = TestHost::new(
        Sequence::new("Main")
            .then(Step("before"))
            .then(WaitForBookmark::new("Wait", "go"))
            .then(Step("after")),
    );
    assert_eq!(host.start(), SchedulerOutcome::Idle);
    assert_eq!(host.recorder.custom("step"), vec![json!("before")]);
    assert!(host.executor.is_persistable());

    assert_eq!(host.resume_and_run("go", json!(null)), closed());
    assert_eq!(host.recorder.custom("step"), vec![json!("before"), json!("after")]);
}

#[test]
fn secondary_root_keeps_workflow_alive() {
    let mut host = TestHost::new(
        Sequence::new("Main")
            .then(ScheduleSecondaryRoot::new("Spawn", WaitForBookmark::new("Side", "side")))
            .then(Step("main-done")),
    );
    assert_eq!(host.start(), SchedulerOutcome::Idle);
    assert_eq!(host.recorder.state_of("Main"), Some(ActivityInstanceState::Closed));
    assert_eq!(host.executor.secondary_roots().count(), 1);

    assert_eq!(host.resume_and_run("side", json!(1)), closed());
}

#[test]
fn root_can_only_be_scheduled_once() {
    let mut host = TestHost::new(Sequence::new("Main"));
    host.start();
    let err = host
        .executor
        .schedule_root_activity(BTreeMap::new(), Default::default())
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidOperation(_)));
}

#[test]
fn unknown_root_input_is_rejected() {
    let mut host = TestHost::new(Sequence::new("Main"));
    let inputs = BTreeMap::from([("missing".to_string(), json!(1))]);
    let err = host
        .executor
        .schedule_root_activity(inputs, Default::default())
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidArgument(_)));
}

#[test]
fn tracking_record_numbers_increase() {
    let mut host = TestHost::new(Sequence::new("Main").then(Step("a")).then(Step("b")));
    host.start();
    let numbers: Vec<u64> = host.recorder.records().iter().map(|r| r.record_number()).collect();
    assert!(!numbers.is_empty());
    assert!(numbers.windows(2).all(|w| w[0] < w[1]));
}
