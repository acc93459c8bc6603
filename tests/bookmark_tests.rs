mod common;

use common::{Observe, Step, TestHost, closed};
use duroflow::activities::{Parallel, Sequence, WaitForBookmark};
use duroflow::runtime::bookmarks::{Bookmark, BookmarkOptions};
use duroflow::runtime::{ActivityInstanceState, BookmarkResumptionResult, SchedulerOutcome};
use duroflow::{Activity, ActivityContext, ActivityMetadata, ActivityResult, HandleKind, Value, Variable};
use serde_json::json;
use uuid::Uuid;

/// Opens a bookmark scope with a fixed correlation id and waits on
/// `approve` inside it.
struct ScopedApproval {
    scope: Uuid,
}

impl Activity for ScopedApproval {
    fn display_name(&self) -> &str {
        "ScopedApproval"
    }

    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        metadata.add_private_variable(Variable::handle("scope", HandleKind::BookmarkScope));
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.initialize_bookmark_scope("scope", self.scope)?;
        ctx.create_bookmark_in_scope("scope", "approve", "approved", BookmarkOptions::default())?;
        Ok(())
    }

    fn on_bookmark_resumed(&self, ctx: &mut ActivityContext<'_>, _callback: &str, _bookmark: &Bookmark, value: Value) -> ActivityResult {
        ctx.track("approved", value);
        Ok(())
    }

    fn can_induce_idle(&self) -> bool {
        true
    }
}

/// Holds a non-blocking bookmark next to its body.
struct Watcher;

impl Activity for Watcher {
    fn display_name(&self) -> &str {
        "Watcher"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.create_bookmark(Some("poke"), "poked", BookmarkOptions::non_blocking())?;
        Ok(())
    }
}

#[test]
fn bookmark_resumes_at_most_once() {
    let mut host = TestHost::new(Sequence::new("Main").then(WaitForBookmark::new("Wait", "go")));
    assert_eq!(host.start(), SchedulerOutcome::Idle);
    assert_eq!(host.resume("go", json!(1)), BookmarkResumptionResult::Success);
    assert_eq!(host.resume("go", json!(2)), BookmarkResumptionResult::NotFound);
    assert_eq!(host.run(), closed());
}

#[test]
fn unknown_bookmark_is_not_found() {
    let mut host = TestHost::new(WaitForBookmark::new("Wait", "go"));
    host.start();
    assert_eq!(host.resume("other", json!(null)), BookmarkResumptionResult::NotFound);
    assert_eq!(host.executor.bookmarks().len(), 1);
}

#[test]
fn resumed_value_lands_in_variable() {
    let mut host = TestHost::new(
        Sequence::new("Main")
            .with_variable(Variable::new("answer", json!(null)))
            .then(WaitForBookmark::new("Wait", "answer").store_in("answer"))
            .then(Observe("answer")),
    );
    host.start();
    assert_eq!(host.resume_and_run("answer", json!({"ok": true})), closed());
    assert_eq!(host.recorder.custom("observed"), vec![json!({"ok": true})]);
}

#[test]
fn duplicate_bookmark_name_faults() {
    let mut host = TestHost::new(
        Parallel::new("Fan")
            .branch(WaitForBookmark::new("First", "same"))
            .branch(WaitForBookmark::new("Second", "same")),
    );
    match host.start() {
        SchedulerOutcome::UnhandledException { fault, .. } => {
            assert_eq!(fault.kind, "InvalidOperation");
            assert!(fault.message.contains("same"));
        }
        other => panic!("expected duplicate bookmark fault, got {other:?}"),
    }
}

#[test]
fn non_blocking_bookmark_does_not_keep_owner_alive() {
    let mut host = TestHost::new(Sequence::new("Main").then(Watcher).then(Step("done")));
    assert_eq!(host.start(), closed());
    assert_eq!(host.recorder.state_of("Watcher"), Some(ActivityInstanceState::Closed));
    assert!(host.executor.bookmarks().is_empty());
}

#[test]
fn scoped_bookmark_resumes_through_its_scope() {
    let scope = Uuid::new_v4();
    let mut host = TestHost::new(ScopedApproval { scope });
    assert_eq!(host.start(), SchedulerOutcome::Idle);
    assert!(host.executor.bookmark_scopes().contains(scope));

    assert_eq!(
        host.executor.try_resume_bookmark(&Bookmark::named("approve"), json!(true)),
        BookmarkResumptionResult::NotFound
    );
    assert_eq!(
        host.executor
            .try_resume_bookmark_in_scope(Uuid::new_v4(), &Bookmark::named("approve"), json!(true)),
        BookmarkResumptionResult::NotFound
    );
    assert_eq!(
        host.executor
            .try_resume_bookmark_in_scope(scope, &Bookmark::named("approve"), json!("yes")),
        BookmarkResumptionResult::Success
    );
    assert_eq!(host.run(), closed());
    assert_eq!(host.recorder.custom("approved"), vec![json!("yes")]);
    assert!(!host.executor.bookmark_scopes().contains(scope));
}
