//! Property-based checks of scheduling and bookmark invariants.

mod common;

use common::{Step, TestHost, closed};
use duroflow::activities::{Parallel, Sequence, WaitForBookmark};
use duroflow::runtime::{ActivityInstanceState, BookmarkResumptionResult, SchedulerOutcome, TrackingRecord};
use proptest::prelude::*;
use serde_json::json;

const NAMES: [&str; 8] = ["s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn sequence_preserves_child_order(len in 0usize..8) {
        let workflow = NAMES[..len]
            .iter()
            .fold(Sequence::new("Main"), |seq, name| seq.then(Step(*name)));
        let mut host = TestHost::new(workflow);
        prop_assert_eq!(host.start(), closed());
        let expected: Vec<_> = NAMES[..len].iter().map(|n| json!(n)).collect();
        prop_assert_eq!(host.recorder.custom("step"), expected);
    }

    #[test]
    fn bookmarks_resume_at_most_once(attempts in 1usize..6, branches in 1usize..5) {
        let workflow = (0..branches).fold(Parallel::new("Fan"), |par, i| {
            par.branch(WaitForBookmark::new(format!("Wait{i}"), format!("b{i}")))
        });
        let mut host = TestHost::new(workflow);
        prop_assert_eq!(host.start(), SchedulerOutcome::Idle);

        for i in 0..branches {
            let name = format!("b{i}");
            let successes = (0..attempts)
                .filter(|_| host.resume(&name, json!(i)) == BookmarkResumptionResult::Success)
                .count();
            prop_assert_eq!(successes, 1);
        }
        prop_assert_eq!(host.run(), closed());
    }

    #[test]
    fn repeated_cancellation_is_idempotent(requests in 1usize..6) {
        let mut host = TestHost::new(Sequence::new("Main").then(WaitForBookmark::new("Wait", "go")));
        prop_assert_eq!(host.start(), SchedulerOutcome::Idle);
        for _ in 0..requests {
            host.executor.cancel_root_activity();
        }
        prop_assert_eq!(host.run(), SchedulerOutcome::Completed(ActivityInstanceState::Canceled));
        for _ in 0..requests {
            host.executor.cancel_root_activity();
        }
        let cancel_records = host
            .recorder
            .records()
            .into_iter()
            .filter(|r| matches!(r, TrackingRecord::CancelRequested { .. }))
            .count();
        prop_assert_eq!(cancel_records, 2);
    }
}
