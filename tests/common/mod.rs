#![allow(dead_code)]

pub mod tracing_capture;

use duroflow::runtime::{
    ActivityExecutor, ActivityInstanceState, BookmarkResumptionResult, ExecutionProperties, ExecutorSettings,
    Extensions, HostRequest, SchedulerOutcome, TrackingParticipant, TrackingRecord, WorkflowInstanceEvent,
    WorkflowSnapshot,
};
use duroflow::runtime::bookmarks::{Bookmark, BookmarkOptions};
use duroflow::{Activity, ActivityContext, ActivityResult, ErrorDetails, Value, WorkflowIdentity};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ----- tracking -----

/// Records everything the executor tracks.
#[derive(Default)]
pub struct Recorder {
    records: Mutex<Vec<TrackingRecord>>,
}

impl TrackingParticipant for Recorder {
    fn track(&self, record: &TrackingRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

impl Recorder {
    pub fn records(&self) -> Vec<TrackingRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }

    /// Data of custom records named `name`, in order.
    pub fn custom(&self, name: &str) -> Vec<Value> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                TrackingRecord::Custom { name: n, data, .. } if n == name => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Final state of every completed activity instance, in completion order.
    pub fn completions(&self) -> Vec<(String, ActivityInstanceState)> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                TrackingRecord::ActivityState { activity, state, .. } => Some((activity.display_name, state)),
                _ => None,
            })
            .collect()
    }

    pub fn state_of(&self, display_name: &str) -> Option<ActivityInstanceState> {
        self.completions()
            .into_iter()
            .rev()
            .find(|(n, _)| n == display_name)
            .map(|(_, s)| s)
    }

    pub fn workflow_events(&self) -> Vec<WorkflowInstanceEvent> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                TrackingRecord::WorkflowInstance { event, .. } => Some(event),
                _ => None,
            })
            .collect()
    }

    /// `(kind, activity)` of every work item that started.
    pub fn work_items(&self) -> Vec<(String, String)> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                TrackingRecord::WorkItem {
                    kind,
                    activity,
                    phase: duroflow::runtime::tracking::WorkItemPhase::Started,
                    ..
                } => Some((kind, activity.display_name)),
                _ => None,
            })
            .collect()
    }
}

// ----- synchronous test host -----

/// Drives an executor on the current thread, servicing host requests inline.
pub struct TestHost {
    pub executor: ActivityExecutor,
    pub recorder: Arc<Recorder>,
    /// Every snapshot the executor asked to persist
    pub saved: Vec<WorkflowSnapshot>,
    /// Fail the next persistence request with this error
    pub fail_next_persist: Option<ErrorDetails>,
    /// Leave transaction outcome requests unanswered for this long at most
    pub outcome_wait: Duration,
}

impl TestHost {
    pub fn new(root: impl Activity + 'static) -> Self {
        Self::with_extensions(Arc::new(root), Extensions::new())
    }

    pub fn with_extensions(root: Arc<dyn Activity>, extensions: Extensions) -> Self {
        Self::with_settings(root, extensions, ExecutorSettings::default())
    }

    pub fn with_settings(root: Arc<dyn Activity>, extensions: Extensions, settings: ExecutorSettings) -> Self {
        let recorder = Arc::new(Recorder::default());
        let extensions = extensions.with_tracking_participant(recorder.clone());
        let executor = ActivityExecutor::new(root, WorkflowIdentity::new("test"), Arc::new(extensions), settings)
            .expect("definition builds");
        Self {
            executor,
            recorder,
            saved: Vec::new(),
            fail_next_persist: None,
            outcome_wait: Duration::from_millis(200),
        }
    }

    /// Wrap an existing executor, e.g. one restored from a snapshot.
    pub fn from_executor(executor: ActivityExecutor, recorder: Arc<Recorder>) -> Self {
        Self {
            executor,
            recorder,
            saved: Vec::new(),
            fail_next_persist: None,
            outcome_wait: Duration::from_millis(200),
        }
    }

    pub fn start(&mut self) -> SchedulerOutcome {
        self.start_with(BTreeMap::new())
    }

    pub fn start_with(&mut self, inputs: BTreeMap<String, Value>) -> SchedulerOutcome {
        self.executor
            .schedule_root_activity(inputs, ExecutionProperties::new())
            .expect("root scheduled");
        self.run()
    }

    /// Run until the executor stops without asking the host for anything.
    pub fn run(&mut self) -> SchedulerOutcome {
        loop {
            let outcome = self.executor.run().expect("executor runs");
            if !self.service() {
                return outcome;
            }
        }
    }

    pub fn resume(&mut self, bookmark: &str, value: Value) -> BookmarkResumptionResult {
        self.executor.try_resume_bookmark(&Bookmark::named(bookmark), value)
    }

    /// Resume and run.
    pub fn resume_and_run(&mut self, bookmark: &str, value: Value) -> SchedulerOutcome {
        let result = self.resume(bookmark, value);
        assert_eq!(result, BookmarkResumptionResult::Success, "bookmark {bookmark}");
        self.run()
    }

    fn service(&mut self) -> bool {
        let requests = self.executor.take_host_requests();
        let serviced = !requests.is_empty();
        for request in requests {
            match request {
                HostRequest::Persist { operation, snapshot, .. } => {
                    let result = match self.fail_next_persist.take() {
                        Some(error) => Err(error),
                        None => {
                            self.saved.push(*snapshot);
                            Ok(())
                        }
                    };
                    self.executor
                        .complete_host_operation(operation, result)
                        .expect("known operation");
                }
                HostRequest::AwaitTransactionOutcome { operation, mut receiver, timeout } => {
                    let wait = timeout.min(self.outcome_wait);
                    let outcome = tokio::runtime::Builder::new_current_thread()
                        .enable_time()
                        .build()
                        .expect("test runtime")
                        .block_on(async { tokio::time::timeout(wait, receiver.recv()).await.ok().flatten() });
                    self.executor
                        .complete_transaction_outcome(operation, outcome)
                        .expect("known operation");
                }
                HostRequest::RunAsync { operation, work } => {
                    let result = futures::executor::block_on(work);
                    self.executor
                        .complete_async_operation(operation, result)
                        .expect("known operation");
                }
            }
        }
        serviced
    }
}

pub fn closed() -> SchedulerOutcome {
    SchedulerOutcome::Completed(ActivityInstanceState::Closed)
}

// ----- test activities -----

/// Tracks a `step` record carrying its name and completes.
pub struct Step(pub &'static str);

impl Activity for Step {
    fn display_name(&self) -> &str {
        self.0
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.track("step", json!(self.0));
        Ok(())
    }
}

/// Waits on a bookmark and ignores cancellation requests.
pub struct Stubborn {
    pub name: &'static str,
    pub bookmark: &'static str,
}

impl Activity for Stubborn {
    fn display_name(&self) -> &str {
        self.name
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.create_bookmark(Some(self.bookmark), "resumed", BookmarkOptions::default())?;
        Ok(())
    }

    fn cancel(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.track("cancel_ignored", json!(self.name));
        Ok(())
    }

    fn can_induce_idle(&self) -> bool {
        true
    }
}

/// Tracks the value of a visible variable under `observed`.
pub struct Observe(pub &'static str);

impl Activity for Observe {
    fn display_name(&self) -> &str {
        "Observe"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let value = ctx.get_value(self.0)?;
        ctx.track("observed", value);
        Ok(())
    }
}

/// Panics while executing.
pub struct Panics;

impl Activity for Panics {
    fn display_name(&self) -> &str {
        "Panics"
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> ActivityResult {
        panic!("activity blew up");
    }
}

/// Creates a bookmark without opting into inducing idle.
pub struct IllegalBookmark;

impl Activity for IllegalBookmark {
    fn display_name(&self) -> &str {
        "IllegalBookmark"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.create_bookmark(Some("never"), "resumed", BookmarkOptions::default())?;
        Ok(())
    }
}

/// Tracks the [`Greeting`] extension it finds under `greeting`.
pub struct UsesExtension;

#[derive(Debug)]
pub struct Greeting(pub &'static str);

impl Activity for UsesExtension {
    fn display_name(&self) -> &str {
        "UsesExtension"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let greeting = ctx.get_extension::<Greeting>()?;
        ctx.track("greeting", json!(greeting.map(|g| g.0)));
        Ok(())
    }
}
