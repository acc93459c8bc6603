use std::sync::Arc;

use crate::activity::{Activity, ActivityMetadata, CompletedChild, FaultDisposition, HandleKind, Variable};
use crate::errors::{ActivityResult, Fault};
use crate::runtime::context::ActivityContext;
use crate::runtime::transaction::{LocalTransaction, Transaction};
use crate::{Value, activity_info, activity_warn};

/// Requests persistence and completes once the instance was saved.
pub struct Persist {
    name: String,
}

impl Persist {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for Persist {
    fn default() -> Self {
        Self::new("Persist")
    }
}

impl Activity for Persist {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.request_persist("persisted");
        Ok(())
    }
}

const NO_PERSIST: &str = "noPersistHandle";

/// Runs its body inside a no-persist zone.
///
/// The zone is held by a private handle variable, so it is released even
/// when the body faults or is canceled.
pub struct NoPersistScope {
    name: String,
    body: Arc<dyn Activity>,
}

impl NoPersistScope {
    pub fn new(name: impl Into<String>, body: impl Activity + 'static) -> Self {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }
}

impl Activity for NoPersistScope {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        metadata.add_private_variable(Variable::handle(NO_PERSIST, HandleKind::NoPersist));
        metadata.add_child(self.body.clone());
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.enter_no_persist(NO_PERSIST)?;
        ctx.schedule_child(0, Some("body_done"), None)?;
        Ok(())
    }

    fn on_child_completed(&self, ctx: &mut ActivityContext<'_>, _callback: &str, _child: &CompletedChild) -> ActivityResult {
        ctx.exit_no_persist(NO_PERSIST)
    }
}

/// Runs `try`; a fault of a matching kind escaping it is handled by running
/// `catch` instead.
///
/// The caught fault is exposed to the catch body as the `exception`
/// variable.
pub struct TryCatch {
    name: String,
    body: Arc<dyn Activity>,
    handler: Arc<dyn Activity>,
    kinds: Vec<String>,
}

impl TryCatch {
    pub fn new(name: impl Into<String>, body: impl Activity + 'static, handler: impl Activity + 'static) -> Self {
        Self {
            name: name.into(),
            body: Arc::new(body),
            handler: Arc::new(handler),
            kinds: Vec::new(),
        }
    }

    /// Only handle faults of `kind`. Without any filter every fault is
    /// handled.
    pub fn catching(mut self, kind: impl Into<String>) -> Self {
        self.kinds.push(kind.into());
        self
    }

    fn handles(&self, fault: &Fault) -> bool {
        self.kinds.is_empty() || self.kinds.iter().any(|k| *k == fault.kind)
    }
}

impl Activity for TryCatch {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        metadata.add_variable(Variable::new("exception", Value::Null));
        metadata.add_child(self.body.clone());
        metadata.add_child(self.handler.clone());
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.schedule_child(0, None, Some("faulted"))?;
        Ok(())
    }

    fn on_child_faulted(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        fault: &Fault,
        propagated_from: &CompletedChild,
    ) -> ActivityResult<FaultDisposition> {
        if !self.handles(fault) {
            return Ok(FaultDisposition::Unhandled);
        }
        activity_warn!(
            ctx,
            fault = %fault,
            source = %propagated_from.display_name,
            "handling fault"
        );
        let exception = serde_json::to_value(fault).unwrap_or(Value::Null);
        ctx.set_value("exception", exception)?;
        ctx.schedule_child(1, None, None)?;
        Ok(FaultDisposition::Handled)
    }
}

/// Runs its body inside the ambient transaction, creating a
/// [`LocalTransaction`] when there is none.
///
/// The outermost scope is the isolation scope and commits when its body
/// finishes; nested scopes join the ambient transaction and complete as soon
/// as their body does.
pub struct TransactionScope {
    name: String,
    body: Arc<dyn Activity>,
    abort_instance_on_failure: bool,
}

impl TransactionScope {
    pub fn new(name: impl Into<String>, body: impl Activity + 'static) -> Self {
        Self {
            name: name.into(),
            body: Arc::new(body),
            abort_instance_on_failure: true,
        }
    }

    /// Fault instead of aborting the workflow when the transaction fails.
    pub fn fault_on_failure(mut self) -> Self {
        self.abort_instance_on_failure = false;
        self
    }
}

impl Activity for TransactionScope {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        metadata.add_child(self.body.clone());
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        match ctx.current_transaction() {
            Some(ambient) => {
                activity_info!(ctx, transaction = %ambient.id(), "joining ambient transaction");
                ctx.schedule_child(0, Some("body_done"), None)?;
            }
            None => ctx.request_transaction_context("context", true),
        }
        Ok(())
    }

    fn on_transaction_context(&self, ctx: &mut ActivityContext<'_>, _callback: &str) -> ActivityResult {
        if ctx.current_transaction().is_none() {
            let transaction = LocalTransaction::new();
            activity_info!(ctx, transaction = %transaction.id(), "transaction started");
            ctx.set_runtime_transaction(transaction, self.abort_instance_on_failure)?;
        }
        ctx.schedule_child(0, Some("body_done"), None)?;
        Ok(())
    }

    fn on_child_completed(&self, ctx: &mut ActivityContext<'_>, _callback: &str, _child: &CompletedChild) -> ActivityResult {
        if ctx.is_cancellation_requested() {
            return Ok(());
        }
        ctx.complete_transaction(Some("committed"))
    }

    fn on_continuation(&self, ctx: &mut ActivityContext<'_>, _callback: &str) -> ActivityResult {
        activity_info!(ctx, "transaction scope completed");
        Ok(())
    }
}
