use std::sync::Arc;

use crate::activity::{Activity, ActivityMetadata, CompletedChild, Variable};
use crate::errors::ActivityResult;
use crate::runtime::context::ActivityContext;
use crate::runtime::dynamic_update::UpdateContext;
use crate::{Value, activity_info};

const INDEX: &str = "index";
const CHILD_DONE: &str = "child_done";

/// Runs its children one after another.
///
/// The position of the running child is kept in a private `index` variable so
/// it survives persistence and is remapped by dynamic update.
pub struct Sequence {
    name: String,
    variables: Vec<Variable>,
    children: Vec<Arc<dyn Activity>>,
}

impl Sequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Declare a variable visible to the children.
    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn then(self, child: impl Activity + 'static) -> Self {
        self.then_arc(Arc::new(child))
    }

    pub fn then_arc(mut self, child: Arc<dyn Activity>) -> Self {
        self.children.push(child);
        self
    }
}

impl Activity for Sequence {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        for variable in &self.variables {
            metadata.add_variable(variable.clone());
        }
        for child in &self.children {
            metadata.add_child(child.clone());
        }
        metadata.add_private_variable(Variable::new(INDEX, Value::from(0)));
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        if ctx.child_count() > 0 {
            ctx.set_value(INDEX, Value::from(0))?;
            ctx.schedule_child(0, Some(CHILD_DONE), None)?;
        }
        Ok(())
    }

    fn on_child_completed(&self, ctx: &mut ActivityContext<'_>, _callback: &str, child: &CompletedChild) -> ActivityResult {
        if ctx.is_cancellation_requested() {
            return Ok(());
        }
        let next = ctx.get_value(INDEX)?.as_u64().unwrap_or(0) as usize + 1;
        if next < ctx.child_count() {
            ctx.set_value(INDEX, Value::from(next))?;
            ctx.schedule_child(next, Some(CHILD_DONE), None)?;
        } else if let Some(result) = &child.result {
            ctx.set_result(result.clone());
        }
        Ok(())
    }

    fn update_instance(&self, ctx: &mut UpdateContext<'_>) {
        let Some(current) = ctx.get_value(INDEX).and_then(Value::as_u64) else {
            return;
        };
        match ctx.new_child_index(current as usize) {
            Some(moved) => {
                if let Err(e) = ctx.set_value(INDEX, Value::from(moved)) {
                    ctx.disallow_update(e.to_string());
                }
            }
            None if (current as usize) < ctx.original_child_count() => {
                ctx.disallow_update(format!("the executing child {current} was removed"));
            }
            None => {}
        }
    }
}

/// Schedules every child at once and completes when all of them have.
pub struct Parallel {
    name: String,
    children: Vec<Arc<dyn Activity>>,
}

impl Parallel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn branch(mut self, child: impl Activity + 'static) -> Self {
        self.children.push(Arc::new(child));
        self
    }
}

impl Activity for Parallel {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        for child in &self.children {
            metadata.add_child(child.clone());
        }
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        // children run before already queued work, so schedule in reverse to
        // start them in declaration order
        for index in (0..ctx.child_count()).rev() {
            ctx.schedule_child(index, None, None)?;
        }
        Ok(())
    }
}

/// Starts its child as an independent root and completes immediately.
///
/// The workflow does not complete until the secondary root has.
pub struct ScheduleSecondaryRoot {
    name: String,
    body: Arc<dyn Activity>,
}

impl ScheduleSecondaryRoot {
    pub fn new(name: impl Into<String>, body: impl Activity + 'static) -> Self {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }
}

impl Activity for ScheduleSecondaryRoot {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        metadata.add_child(self.body.clone());
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let root = ctx.schedule_secondary_root(0)?;
        activity_info!(ctx, secondary_root = %root, "secondary root scheduled");
        Ok(())
    }
}
