//! Error taxonomy for the execution engine.
//!
//! Failures fall into four buckets:
//!
//! - **Business faults** ([`Fault`]) raised by activity code. They travel up the
//!   instance tree looking for a fault handler and only become unhandled when
//!   no ancestor registered one.
//! - **Infrastructure faults** ([`ErrorDetails::Infrastructure`]) raised by host
//!   callbacks, persistence, extension lookup or execution-property scopes.
//!   They always abort the workflow instance and are never visible to
//!   workflow fault handlers.
//! - **Structural errors** ([`WorkflowError::InvalidOperation`],
//!   [`WorkflowError::InvalidArgument`], [`WorkflowError::InstanceUpdate`])
//!   returned synchronously from API misuse.
//! - **Fatal conditions** ([`FatalError`]) which are re-raised at every engine
//!   catch site and never converted into one of the above.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

use crate::ids::{ActivityId, InstanceId};
use crate::providers::ProviderError;

/// A business fault raised by activity code.
///
/// Faults are serializable so they can sit in persisted work items (fault
/// callbacks, pending rethrows) and in the workflow's completion exception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    /// Fault classifier used by handlers to decide whether they can handle it
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// Optional structured payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Instance that raised the fault, filled in by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<FaultSource>,
    /// Fault this one wraps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<Fault>>,
}

/// Where a fault was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSource {
    pub instance: InstanceId,
    pub activity: ActivityId,
    pub display_name: String,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            data: None,
            source: None,
            inner: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_inner(mut self, inner: Fault) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Attach a source unless one is already recorded.
    pub(crate) fn sourced(mut self, source: FaultSource) -> Self {
        if self.source.is_none() {
            self.source = Some(source);
        }
        self
    }

    pub(crate) fn transaction_aborted(message: impl Into<String>) -> Self {
        Self::new("TransactionAborted", message)
    }

    pub(crate) fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new("InvalidOperation", message)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(inner) = &self.inner {
            write!(f, " (caused by {inner})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Fault {}

/// Configuration error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    /// The activity tree declares something the engine cannot execute
    InvalidDefinition,
    /// A persisted instance does not match the definition it is loaded with
    DefinitionMismatch,
    /// A required host extension is missing
    MissingExtension,
}

/// Classified failure reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorDetails {
    /// Business fault raised by activity code
    Application(Fault),
    /// Host, provider or callback failure
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
    /// Misconfiguration detected at runtime
    Configuration { kind: ConfigErrorKind, message: String },
}

impl ErrorDetails {
    pub fn infrastructure(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Infrastructure {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn configuration(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Self::Configuration {
            kind,
            message: message.into(),
        }
    }

    /// Category name for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application(_) => "application",
            ErrorDetails::Infrastructure { .. } => "infrastructure",
            ErrorDetails::Configuration { .. } => "configuration",
        }
    }

    /// Fold into a fault, used when an abort reason must be reported as the
    /// workflow's completion exception.
    pub fn to_fault(&self) -> Fault {
        match self {
            ErrorDetails::Application(fault) => fault.clone(),
            ErrorDetails::Infrastructure { operation, message, .. } => {
                Fault::new("Infrastructure", format!("{operation}: {message}"))
            }
            ErrorDetails::Configuration { kind, message } => Fault::new("Configuration", format!("{kind:?}: {message}")),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Application(fault) => write!(f, "application fault: {fault}"),
            ErrorDetails::Infrastructure { operation, message, .. } => {
                write!(f, "infrastructure error in {operation}: {message}")
            }
            ErrorDetails::Configuration { kind, message } => write!(f, "configuration error ({kind:?}): {message}"),
        }
    }
}

impl std::error::Error for ErrorDetails {}

/// A host extension or notification callback failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackError {
    pub callback: String,
    pub message: String,
}

impl CallbackError {
    pub fn new(callback: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            callback: callback.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "host callback '{}' failed: {}", self.callback, self.message)
    }
}

impl std::error::Error for CallbackError {}

impl From<CallbackError> for ErrorDetails {
    fn from(e: CallbackError) -> Self {
        ErrorDetails::infrastructure(e.callback, e.message)
    }
}

/// An activity instance that prevents a dynamic update from being applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingActivity {
    pub instance: InstanceId,
    pub activity: ActivityId,
    pub display_name: String,
    pub reason: String,
}

/// A dynamic update was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceUpdateError {
    pub message: String,
    pub blocking_activities: Vec<BlockingActivity>,
}

impl InstanceUpdateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            blocking_activities: Vec::new(),
        }
    }

    pub fn blocked(blocking_activities: Vec<BlockingActivity>) -> Self {
        let reasons: Vec<String> = blocking_activities
            .iter()
            .map(|b| format!("{} ({}): {}", b.display_name, b.instance, b.reason))
            .collect();
        Self {
            message: format!("update blocked by {} activities: {}", reasons.len(), reasons.join("; ")),
            blocking_activities,
        }
    }
}

impl std::fmt::Display for InstanceUpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for InstanceUpdateError {}

/// Errors surfaced by the public engine and host APIs.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowError {
    /// The operation is not valid in the current state
    InvalidOperation(String),
    /// An argument was rejected
    InvalidArgument(String),
    /// A dynamic update could not be applied
    InstanceUpdate(InstanceUpdateError),
    /// Persisted state does not belong to the supplied definition
    VersionMismatch { expected: String, found: String },
    /// A host callback failed
    Callback(CallbackError),
    /// A persistence provider failed
    Provider(ProviderError),
    /// The instance was aborted; `reason` is the original cause
    Canceled { reason: ErrorDetails },
    /// A bounded wait expired
    Timeout,
}

impl WorkflowError {
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        WorkflowError::InvalidOperation(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        WorkflowError::InvalidArgument(message.into())
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowError::InvalidOperation(m) => write!(f, "invalid operation: {m}"),
            WorkflowError::InvalidArgument(m) => write!(f, "invalid argument: {m}"),
            WorkflowError::InstanceUpdate(e) => write!(f, "instance update failed: {e}"),
            WorkflowError::VersionMismatch { expected, found } => {
                write!(f, "workflow definition mismatch: expected {expected}, found {found}")
            }
            WorkflowError::Callback(e) => e.fmt(f),
            WorkflowError::Provider(e) => write!(f, "provider error: {e}"),
            WorkflowError::Canceled { reason } => write!(f, "workflow instance aborted: {reason}"),
            WorkflowError::Timeout => f.write_str("operation timed out"),
        }
    }
}

impl std::error::Error for WorkflowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkflowError::InstanceUpdate(e) => Some(e),
            WorkflowError::Callback(e) => Some(e),
            WorkflowError::Provider(e) => Some(e),
            WorkflowError::Canceled { reason } => Some(reason),
            _ => None,
        }
    }
}

impl From<ProviderError> for WorkflowError {
    fn from(e: ProviderError) -> Self {
        WorkflowError::Provider(e)
    }
}

impl From<InstanceUpdateError> for WorkflowError {
    fn from(e: InstanceUpdateError) -> Self {
        WorkflowError::InstanceUpdate(e)
    }
}

impl From<CallbackError> for WorkflowError {
    fn from(e: CallbackError) -> Self {
        WorkflowError::Callback(e)
    }
}

/// Error returned from activity callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityError {
    /// Business fault, routed through the fault-handler chain
    Fault(Fault),
    /// Infrastructure failure, aborts the workflow instance
    Abort(ErrorDetails),
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityError::Fault(fault) => fault.fmt(f),
            ActivityError::Abort(details) => details.fmt(f),
        }
    }
}

impl std::error::Error for ActivityError {}

impl From<Fault> for ActivityError {
    fn from(f: Fault) -> Self {
        ActivityError::Fault(f)
    }
}

impl From<ErrorDetails> for ActivityError {
    fn from(d: ErrorDetails) -> Self {
        match d {
            ErrorDetails::Application(fault) => ActivityError::Fault(fault),
            other => ActivityError::Abort(other),
        }
    }
}

/// Misusing the context from activity code is a business fault; host and
/// provider failures are not.
impl From<WorkflowError> for ActivityError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::InvalidOperation(m) => ActivityError::Fault(Fault::invalid_operation(m)),
            WorkflowError::InvalidArgument(m) => ActivityError::Fault(Fault::new("InvalidArgument", m)),
            WorkflowError::Callback(c) => ActivityError::Abort(c.into()),
            WorkflowError::Provider(p) => ActivityError::Abort(p.to_infrastructure_error()),
            WorkflowError::Canceled { reason } => ActivityError::Abort(reason),
            other => ActivityError::Fault(Fault::new("WorkflowError", other.to_string())),
        }
    }
}

pub type ActivityResult<T = ()> = Result<T, ActivityError>;

/// Panic payload for conditions that must never be swallowed by the engine.
///
/// Raise with `std::panic::panic_any(FatalError::new(..))`.
#[derive(Debug, Clone)]
pub struct FatalError {
    pub message: String,
}

impl FatalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fatal: {}", self.message)
    }
}

/// Whether a panic payload is fatal.
pub fn is_fatal(payload: &(dyn Any + Send)) -> bool {
    payload.is::<FatalError>()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "activity panicked".to_string()
    }
}

/// Run an activity callback, converting panics into business faults.
///
/// Fatal payloads are re-raised untouched.
pub(crate) fn invoke_guarded<T>(f: impl FnOnce() -> ActivityResult<T>) -> ActivityResult<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            if is_fatal(payload.as_ref()) {
                resume_unwind(payload);
            }
            Err(ActivityError::Fault(Fault::new("panic", panic_message(payload.as_ref()))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_error_maps_to_activity_error() {
        let e: ActivityError = WorkflowError::invalid_operation("bookmark exists").into();
        match e {
            ActivityError::Fault(f) => {
                assert_eq!(f.kind, "InvalidOperation");
                assert!(f.message.contains("bookmark exists"));
            }
            other => panic!("expected fault, got {other:?}"),
        }

        let e: ActivityError = WorkflowError::Callback(CallbackError::new("get_extension", "boom")).into();
        assert!(matches!(e, ActivityError::Abort(ErrorDetails::Infrastructure { .. })));
    }

    #[test]
    fn guarded_invocation_turns_panics_into_faults() {
        let result: ActivityResult<()> = invoke_guarded(|| panic!("kaboom"));
        match result {
            Err(ActivityError::Fault(f)) => {
                assert_eq!(f.kind, "panic");
                assert_eq!(f.message, "kaboom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn guarded_invocation_rethrows_fatal() {
        let outcome = std::panic::catch_unwind(|| {
            let _: ActivityResult<()> = invoke_guarded(|| std::panic::panic_any(FatalError::new("oom")));
        });
        let payload = outcome.expect_err("fatal panic must escape");
        assert!(is_fatal(payload.as_ref()));
    }

    #[test]
    fn fault_display_includes_inner() {
        let f = Fault::new("Outer", "wrapped").with_inner(Fault::new("Inner", "root cause"));
        let s = f.to_string();
        assert!(s.contains("Outer: wrapped"));
        assert!(s.contains("Inner: root cause"));
    }

    #[test]
    fn instance_update_error_lists_reasons() {
        let err = InstanceUpdateError::blocked(vec![BlockingActivity {
            instance: InstanceId(4),
            activity: ActivityId(2),
            display_name: "Wait".into(),
            reason: "removed while executing".into(),
        }]);
        assert_eq!(err.blocking_activities.len(), 1);
        assert!(err.message.contains("Wait"));
        assert!(err.message.contains("removed while executing"));
    }
}
