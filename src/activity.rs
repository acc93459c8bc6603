//! The activity contract implemented by catalog and user code.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::Value;
use crate::errors::{ActivityResult, Fault};
use crate::ids::{ActivityId, InstanceId};
use crate::runtime::bookmarks::Bookmark;
use crate::runtime::context::ActivityContext;
use crate::runtime::dynamic_update::UpdateContext;
use crate::runtime::instance::ActivityInstanceState;

/// An immutable, shareable unit-of-work definition.
///
/// One definition may back any number of live instances at once, so
/// implementations keep no per-invocation state on `self`. Per-invocation
/// state lives in private variables declared from [`Activity::cache_metadata`]
/// and accessed through the [`ActivityContext`].
///
/// Callbacks are identified by name so that pending continuations survive
/// persistence. Each `on_*` method receives the name that was passed when the
/// continuation was registered.
pub trait Activity: Send + Sync {
    fn display_name(&self) -> &str;

    /// Declare arguments, variables, delegates and children.
    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        let _ = metadata;
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult;

    /// Called once when cancellation is requested while the instance executes.
    ///
    /// The default cancels every child and completes the instance as
    /// `Canceled` once they are gone.
    fn cancel(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.perform_default_cancelation()
    }

    /// Notification that the instance is being torn down without completing.
    fn abort(&self, reason: &Fault) {
        let _ = reason;
    }

    fn on_child_completed(&self, ctx: &mut ActivityContext<'_>, callback: &str, child: &CompletedChild) -> ActivityResult {
        let _ = (ctx, callback, child);
        Ok(())
    }

    /// A fault escaped a child scheduled with a fault callback.
    ///
    /// Returning [`FaultDisposition::Unhandled`] rethrows the fault from this
    /// instance.
    fn on_child_faulted(
        &self,
        ctx: &mut ActivityContext<'_>,
        callback: &str,
        fault: &Fault,
        propagated_from: &CompletedChild,
    ) -> ActivityResult<FaultDisposition> {
        let _ = (ctx, callback, fault, propagated_from);
        Ok(FaultDisposition::Unhandled)
    }

    fn on_bookmark_resumed(
        &self,
        ctx: &mut ActivityContext<'_>,
        callback: &str,
        bookmark: &Bookmark,
        value: Value,
    ) -> ActivityResult {
        let _ = (ctx, callback, bookmark, value);
        Ok(())
    }

    fn on_async_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        callback: &str,
        result: Result<Value, Fault>,
    ) -> ActivityResult {
        let _ = (ctx, callback);
        result.map(|_| ()).map_err(Into::into)
    }

    /// The ambient transaction context requested with
    /// [`ActivityContext::request_transaction_context`] is available.
    fn on_transaction_context(&self, ctx: &mut ActivityContext<'_>, callback: &str) -> ActivityResult {
        let _ = (ctx, callback);
        Ok(())
    }

    /// A value-less continuation fired: persistence finished or the
    /// transaction this instance completed has committed.
    fn on_continuation(&self, ctx: &mut ActivityContext<'_>, callback: &str) -> ActivityResult {
        let _ = (ctx, callback);
        Ok(())
    }

    /// Adjust or veto a live instance during dynamic update. Called on the new
    /// definition.
    fn update_instance(&self, ctx: &mut UpdateContext<'_>) {
        let _ = ctx;
    }

    /// Activities that create blocking bookmarks must opt in.
    fn can_induce_idle(&self) -> bool {
        false
    }
}

/// How a fault callback disposed of the fault it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    Handled,
    Unhandled,
}

/// Summary of a finished child passed to completion and fault callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedChild {
    pub instance: InstanceId,
    pub activity: ActivityId,
    pub display_name: String,
    pub state: ActivityInstanceState,
    /// Position of the child in the parent's declared children
    pub child_index: Option<usize>,
    /// Value the child passed to `set_result`
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgumentDirection {
    In,
    Out,
    InOut,
}

/// Where an argument's value comes from when the instance is scheduled.
#[derive(Clone)]
pub enum ArgumentBinding {
    Literal(Value),
    /// Read from (and for out arguments written back to) a variable visible
    /// from the scheduling parent
    Variable(String),
    /// Evaluated by scheduling an expression activity
    Expression(Arc<dyn Activity>),
    /// The argument's declared default
    Default,
}

impl std::fmt::Debug for ArgumentBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgumentBinding::Literal(v) => write!(f, "Literal({v})"),
            ArgumentBinding::Variable(n) => write!(f, "Variable({n})"),
            ArgumentBinding::Expression(a) => write!(f, "Expression({})", a.display_name()),
            ArgumentBinding::Default => f.write_str("Default"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeArgument {
    pub name: String,
    pub direction: ArgumentDirection,
    pub binding: ArgumentBinding,
    pub default: Value,
}

impl RuntimeArgument {
    pub fn input(name: impl Into<String>, binding: ArgumentBinding) -> Self {
        Self {
            name: name.into(),
            direction: ArgumentDirection::In,
            binding,
            default: Value::Null,
        }
    }

    pub fn output(name: impl Into<String>, binding: ArgumentBinding) -> Self {
        Self {
            name: name.into(),
            direction: ArgumentDirection::Out,
            binding,
            default: Value::Null,
        }
    }

    pub fn in_out(name: impl Into<String>, binding: ArgumentBinding) -> Self {
        Self {
            name: name.into(),
            direction: ArgumentDirection::InOut,
            binding,
            default: Value::Null,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }
}

/// Resources that need explicit initialization and teardown when their
/// environment is created and disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleKind {
    /// Enter/exit a no-persist zone; an entered handle is exited on disposal
    NoPersist,
    /// A correlation scope for bookmarks
    BookmarkScope,
    /// Marker for the ambient transaction owned by a scope
    RuntimeTransaction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariableKind {
    Value,
    Handle(HandleKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub default: Value,
    /// Exposed to host inspection tooling
    pub mappable: bool,
    pub kind: VariableKind,
}

impl Variable {
    pub fn new(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default,
            mappable: false,
            kind: VariableKind::Value,
        }
    }

    pub fn handle(name: impl Into<String>, kind: HandleKind) -> Self {
        Self {
            name: name.into(),
            default: Value::Null,
            mappable: false,
            kind: VariableKind::Handle(kind),
        }
    }

    pub fn mappable(mut self) -> Self {
        self.mappable = true;
        self
    }
}

/// A parameterized child invoked through
/// [`ActivityContext::schedule_delegate`]. The handler sees the parameters as
/// delegate arguments.
#[derive(Clone)]
pub struct ActivityDelegate {
    pub parameters: Vec<String>,
    pub handler: Arc<dyn Activity>,
}

impl ActivityDelegate {
    pub fn new(parameters: Vec<String>, handler: Arc<dyn Activity>) -> Self {
        Self { parameters, handler }
    }
}

/// Declarations collected from [`Activity::cache_metadata`].
#[derive(Default)]
pub struct ActivityMetadata {
    pub(crate) arguments: Vec<RuntimeArgument>,
    pub(crate) delegates: Vec<ActivityDelegate>,
    pub(crate) public_variables: Vec<Variable>,
    pub(crate) private_variables: Vec<Variable>,
    pub(crate) children: Vec<Arc<dyn Activity>>,
    pub(crate) errors: Vec<String>,
}

impl ActivityMetadata {
    pub fn add_argument(&mut self, argument: RuntimeArgument) {
        self.arguments.push(argument);
    }

    pub fn add_delegate(&mut self, delegate: ActivityDelegate) {
        self.delegates.push(delegate);
    }

    /// Variables visible to descendants.
    pub fn add_variable(&mut self, variable: Variable) {
        self.public_variables.push(variable);
    }

    /// Variables visible only to this activity.
    pub fn add_private_variable(&mut self, variable: Variable) {
        self.private_variables.push(variable);
    }

    pub fn add_child(&mut self, child: Arc<dyn Activity>) {
        self.children.push(child);
    }

    pub fn add_validation_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}
