use std::sync::Arc;

use crate::activity::{Activity, ActivityMetadata, ArgumentBinding, RuntimeArgument};
use crate::errors::{ActivityResult, Fault};
use crate::runtime::async_operation::AsyncWork;
use crate::runtime::bookmarks::{Bookmark, BookmarkOptions};
use crate::runtime::context::ActivityContext;
use crate::{Value, activity_info};

const RESULT: &str = "result";

fn result_argument(metadata: &mut ActivityMetadata, variable: &Option<String>) {
    if let Some(variable) = variable {
        metadata.add_argument(RuntimeArgument::output(
            RESULT,
            ArgumentBinding::Variable(variable.clone()),
        ));
    }
}

fn store_result(ctx: &mut ActivityContext<'_>, variable: &Option<String>, value: Value) -> ActivityResult {
    if variable.is_some() {
        ctx.set_argument(RESULT, value.clone())?;
    }
    ctx.set_result(value);
    Ok(())
}

/// Waits until the named bookmark is resumed and completes with the resumed
/// value.
pub struct WaitForBookmark {
    name: String,
    bookmark: String,
    result: Option<String>,
}

impl WaitForBookmark {
    pub fn new(name: impl Into<String>, bookmark: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bookmark: bookmark.into(),
            result: None,
        }
    }

    /// Write the resumed value to `variable`.
    pub fn store_in(mut self, variable: impl Into<String>) -> Self {
        self.result = Some(variable.into());
        self
    }
}

impl Activity for WaitForBookmark {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        result_argument(metadata, &self.result);
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.create_bookmark(Some(&self.bookmark), "resumed", BookmarkOptions::default())?;
        activity_info!(ctx, bookmark = %self.bookmark, "waiting for bookmark");
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        _bookmark: &Bookmark,
        value: Value,
    ) -> ActivityResult {
        store_result(ctx, &self.result, value)
    }

    fn can_induce_idle(&self) -> bool {
        true
    }
}

type WorkFactory = dyn Fn(Value) -> AsyncWork + Send + Sync;

/// Runs a future on the host and completes with its output.
///
/// The factory receives the value of the `input` argument. The instance
/// cannot persist while the future is outstanding.
pub struct InvokeAsync {
    name: String,
    input: ArgumentBinding,
    result: Option<String>,
    work: Arc<WorkFactory>,
}

impl InvokeAsync {
    pub fn new<F>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(Value) -> AsyncWork + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            input: ArgumentBinding::Default,
            result: None,
            work: Arc::new(work),
        }
    }

    pub fn with_input(mut self, input: ArgumentBinding) -> Self {
        self.input = input;
        self
    }

    pub fn store_in(mut self, variable: impl Into<String>) -> Self {
        self.result = Some(variable.into());
        self
    }
}

impl Activity for InvokeAsync {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        metadata.add_argument(RuntimeArgument::input("input", self.input.clone()));
        result_argument(metadata, &self.result);
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let input = ctx.get_argument("input")?;
        let operation = ctx.spawn_async("completed", (self.work)(input));
        activity_info!(ctx, operation = %operation, "asynchronous work started");
        Ok(())
    }

    fn on_async_completed(&self, ctx: &mut ActivityContext<'_>, _callback: &str, result: Result<Value, Fault>) -> ActivityResult {
        store_result(ctx, &self.result, result?)
    }
}

/// Registers an operation that something outside the engine completes.
///
/// The operation id is published as a custom tracking record named
/// `operation` so the host can find it.
pub struct ExternalOperation {
    name: String,
    result: Option<String>,
}

impl ExternalOperation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: None,
        }
    }

    pub fn store_in(mut self, variable: impl Into<String>) -> Self {
        self.result = Some(variable.into());
        self
    }
}

impl Activity for ExternalOperation {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        result_argument(metadata, &self.result);
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let operation = ctx.begin_async_operation("completed");
        ctx.track("operation", Value::from(operation.0));
        Ok(())
    }

    fn on_async_completed(&self, ctx: &mut ActivityContext<'_>, _callback: &str, result: Result<Value, Fault>) -> ActivityResult {
        store_result(ctx, &self.result, result?)
    }
}
