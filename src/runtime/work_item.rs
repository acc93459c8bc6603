//! Units of schedulable work.

use serde::{Deserialize, Serialize};

use crate::Value;
use crate::activity::CompletedChild;
use crate::errors::{ErrorDetails, Fault};
use crate::ids::{InstanceId, OperationId};
use crate::runtime::bookmarks::Bookmark;
use crate::runtime::location::LocationRef;

/// Why a value-less continuation fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContinuationReason {
    Persisted,
    TransactionCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItemKind {
    /// Resolve arguments and run the activity body
    ExecuteActivity,
    /// Continue argument resolution after an argument expression finished
    ResolveNextArgument { next_index: usize },
    /// Run an argument expression whose result lands in `result`
    ExecuteExpression { result: LocationRef },
    /// Run the workflow root
    ExecuteRoot { requires_initialization: bool },
    Cancel,
    /// Abort the target subtree; used when a fault would escape an isolation scope
    AbortActivity { reason: Fault, origin: InstanceId },
    /// Raise a fault on behalf of the target
    PropagateException { fault: Fault },
    /// A fault handler declined the fault; continue from the handler
    RethrowException { fault: Fault },
    /// Commit the ambient transaction owned by the target
    CompleteTransaction,
    TransactionContext { callback: String, requires: bool },
    Persist { callback: String },
    CompleteAsyncOperation {
        operation: OperationId,
        callback: String,
        result: Result<Value, Fault>,
    },
    BookmarkResumption {
        bookmark: Bookmark,
        callback: String,
        value: Value,
    },
    CompletionCallback { callback: String, child: CompletedChild },
    FaultCallback {
        callback: String,
        fault: Fault,
        propagated_from: CompletedChild,
    },
    Continuation { callback: String, reason: ContinuationReason },
    /// Keeps the target alive so its state is re-evaluated
    Empty,
}

impl WorkItemKind {
    pub fn name(&self) -> &'static str {
        match self {
            WorkItemKind::ExecuteActivity => "ExecuteActivity",
            WorkItemKind::ResolveNextArgument { .. } => "ResolveNextArgument",
            WorkItemKind::ExecuteExpression { .. } => "ExecuteExpression",
            WorkItemKind::ExecuteRoot { .. } => "ExecuteRoot",
            WorkItemKind::Cancel => "Cancel",
            WorkItemKind::AbortActivity { .. } => "AbortActivity",
            WorkItemKind::PropagateException { .. } => "PropagateException",
            WorkItemKind::RethrowException { .. } => "RethrowException",
            WorkItemKind::CompleteTransaction => "CompleteTransaction",
            WorkItemKind::TransactionContext { .. } => "TransactionContext",
            WorkItemKind::Persist { .. } => "Persist",
            WorkItemKind::CompleteAsyncOperation { .. } => "CompleteAsyncOperation",
            WorkItemKind::BookmarkResumption { .. } => "BookmarkResumption",
            WorkItemKind::CompletionCallback { .. } => "CompletionCallback",
            WorkItemKind::FaultCallback { .. } => "FaultCallback",
            WorkItemKind::Continuation { .. } => "Continuation",
            WorkItemKind::Empty => "Empty",
        }
    }
}

/// One atomic step of execution targeting a single instance.
///
/// A work item is executed exactly once. Its body either finishes
/// synchronously or parks the item with the executor until the host
/// completes the operation it started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub instance: InstanceId,
    pub kind: WorkItemKind,
    /// Leave a no-persist zone once this item finishes
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub(crate) exit_no_persist_required: bool,
    #[serde(skip)]
    pub(crate) exception_to_propagate: Option<Fault>,
    #[serde(skip)]
    pub(crate) workflow_abort: Option<ErrorDetails>,
}

impl WorkItem {
    pub fn new(instance: InstanceId, kind: WorkItemKind) -> Self {
        Self {
            instance,
            kind,
            exit_no_persist_required: false,
            exception_to_propagate: None,
            workflow_abort: None,
        }
    }

    pub fn empty(instance: InstanceId) -> Self {
        Self::new(instance, WorkItemKind::Empty)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, WorkItemKind::Empty)
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}
