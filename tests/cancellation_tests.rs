mod common;

use common::{Step, Stubborn, TestHost};
use duroflow::activities::{Parallel, Sequence, WaitForBookmark};
use duroflow::runtime::{ActivityInstanceState, BookmarkResumptionResult, SchedulerOutcome, TrackingRecord};
use serde_json::json;

fn canceled() -> SchedulerOutcome {
    SchedulerOutcome::Completed(ActivityInstanceState::Canceled)
}

fn cancel_requests(host: &TestHost) -> Vec<String> {
    host.recorder
        .records()
        .into_iter()
        .filter_map(|r| match r {
            TrackingRecord::CancelRequested { activity, .. } => Some(activity.display_name),
            _ => None,
        })
        .collect()
}

#[test]
fn cancel_while_waiting_completes_canceled() {
    let mut host = TestHost::new(
        Sequence::new("Main")
            .then(WaitForBookmark::new("Wait", "go"))
            .then(Step("after")),
    );
    assert_eq!(host.start(), SchedulerOutcome::Idle);

    host.executor.cancel_root_activity();
    assert_eq!(host.run(), canceled());
    assert_eq!(host.recorder.state_of("Wait"), Some(ActivityInstanceState::Canceled));
    assert_eq!(host.recorder.state_of("Main"), Some(ActivityInstanceState::Canceled));
    assert!(host.recorder.custom("step").is_empty());
    assert_eq!(host.resume("go", json!(null)), BookmarkResumptionResult::NotFound);
}

#[test]
fn repeated_cancel_requests_are_recorded_once() {
    let mut host = TestHost::new(Sequence::new("Main").then(WaitForBookmark::new("Wait", "go")));
    host.start();
    host.executor.cancel_root_activity();
    host.executor.cancel_root_activity();
    assert_eq!(host.run(), canceled());
    host.executor.cancel_root_activity();

    let requests = cancel_requests(&host);
    assert_eq!(requests.iter().filter(|n| *n == "Main").count(), 1);
    assert_eq!(requests.iter().filter(|n| *n == "Wait").count(), 1);
}

#[test]
fn cancel_reaches_every_parallel_branch() {
    let mut host = TestHost::new(
        Parallel::new("Fan")
            .branch(WaitForBookmark::new("Left", "left"))
            .branch(WaitForBookmark::new("Right", "right")),
    );
    assert_eq!(host.start(), SchedulerOutcome::Idle);
    assert_eq!(host.executor.bookmarks().len(), 2);

    host.executor.cancel_root_activity();
    assert_eq!(host.run(), canceled());
    assert_eq!(host.recorder.state_of("Left"), Some(ActivityInstanceState::Canceled));
    assert_eq!(host.recorder.state_of("Right"), Some(ActivityInstanceState::Canceled));
    assert!(host.executor.bookmarks().is_empty());
}

#[test]
fn activity_may_ignore_cancellation() {
    let mut host = TestHost::new(Sequence::new("Main").then(Stubborn {
        name: "Stubborn",
        bookmark: "stubborn",
    }));
    assert_eq!(host.start(), SchedulerOutcome::Idle);

    host.executor.cancel_root_activity();
    assert_eq!(host.run(), SchedulerOutcome::Idle);
    assert_eq!(host.recorder.custom("cancel_ignored"), vec![json!("Stubborn")]);

    assert_eq!(host.resume_and_run("stubborn", json!(1)), canceled());
    assert_eq!(host.recorder.state_of("Stubborn"), Some(ActivityInstanceState::Closed));
    assert_eq!(host.recorder.state_of("Main"), Some(ActivityInstanceState::Canceled));
}

#[test]
fn cancel_before_start_closes_nothing() {
    let mut host = TestHost::new(Sequence::new("Main").then(Step("a")));
    host.executor.cancel_root_activity();
    assert!(cancel_requests(&host).is_empty());
    assert_eq!(host.start(), common::closed());
}
