//! Tracking records emitted while an instance runs.
//!
//! Participants observe; they cannot influence execution. Record numbers
//! increase monotonically per workflow instance and survive persistence.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Value;
use crate::errors::Fault;
use crate::ids::{ActivityId, InstanceId};
use crate::runtime::bookmarks::Bookmark;
use crate::runtime::instance::ActivityInstanceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowInstanceEvent {
    Started,
    Idle,
    Persisted,
    Unloaded,
    Completed,
    Canceled,
    Faulted,
    Aborted,
    Terminated,
    UnhandledException,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItemPhase {
    Started,
    Completed,
    Yielded,
}

/// Identifies an activity instance in tracking output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRef {
    pub instance: InstanceId,
    pub activity: ActivityId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackingRecord {
    WorkflowInstance {
        record_number: u64,
        workflow: Uuid,
        event: WorkflowInstanceEvent,
    },
    ActivityScheduled {
        record_number: u64,
        activity: ActivityRef,
        parent: Option<ActivityRef>,
    },
    ActivityState {
        record_number: u64,
        activity: ActivityRef,
        state: ActivityInstanceState,
    },
    BookmarkResumption {
        record_number: u64,
        bookmark: Bookmark,
        owner: ActivityRef,
        value: Value,
    },
    CancelRequested {
        record_number: u64,
        activity: ActivityRef,
    },
    FaultPropagation {
        record_number: u64,
        source: ActivityRef,
        handler: Option<ActivityRef>,
        fault: Fault,
    },
    WorkItem {
        record_number: u64,
        activity: ActivityRef,
        kind: String,
        phase: WorkItemPhase,
    },
    Custom {
        record_number: u64,
        activity: ActivityRef,
        name: String,
        data: Value,
    },
}

impl TrackingRecord {
    pub fn record_number(&self) -> u64 {
        match self {
            TrackingRecord::WorkflowInstance { record_number, .. }
            | TrackingRecord::ActivityScheduled { record_number, .. }
            | TrackingRecord::ActivityState { record_number, .. }
            | TrackingRecord::BookmarkResumption { record_number, .. }
            | TrackingRecord::CancelRequested { record_number, .. }
            | TrackingRecord::FaultPropagation { record_number, .. }
            | TrackingRecord::WorkItem { record_number, .. }
            | TrackingRecord::Custom { record_number, .. } => *record_number,
        }
    }
}

pub trait TrackingParticipant: Send + Sync {
    fn track(&self, record: &TrackingRecord);
}
