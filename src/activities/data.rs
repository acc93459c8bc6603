use std::sync::Arc;

use crate::Value;
use crate::activity::{Activity, ActivityMetadata, ArgumentBinding, RuntimeArgument};
use crate::errors::{ActivityResult, Fault};
use crate::runtime::context::ActivityContext;

/// Evaluates to a constant. Mostly used as an argument expression.
pub struct Literal {
    value: Value,
}

impl Literal {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

impl Activity for Literal {
    fn display_name(&self) -> &str {
        "Literal"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.set_result(self.value.clone());
        Ok(())
    }
}

/// Copies a value into a variable.
///
/// Declares `value` (in) and `to` (out, bound to the target variable); the
/// variable is written when the assignment completes.
pub struct Assign {
    to: String,
    value: ArgumentBinding,
}

impl Assign {
    /// Assign the result of evaluating `expression`.
    pub fn expression(to: impl Into<String>, expression: Arc<dyn Activity>) -> Self {
        Self {
            to: to.into(),
            value: ArgumentBinding::Expression(expression),
        }
    }

    pub fn literal(to: impl Into<String>, value: Value) -> Self {
        Self {
            to: to.into(),
            value: ArgumentBinding::Literal(value),
        }
    }

    /// Copy another visible variable.
    pub fn variable(to: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            value: ArgumentBinding::Variable(from.into()),
        }
    }
}

impl Activity for Assign {
    fn display_name(&self) -> &str {
        "Assign"
    }

    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        metadata.add_argument(RuntimeArgument::input("value", self.value.clone()));
        metadata.add_argument(RuntimeArgument::output(
            "to",
            ArgumentBinding::Variable(self.to.clone()),
        ));
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let value = ctx.get_argument("value")?;
        ctx.set_argument("to", value.clone())?;
        ctx.set_result(value);
        Ok(())
    }
}

/// Raises a business fault.
pub struct Throw {
    name: String,
    fault: Fault,
}

impl Throw {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: "Throw".to_string(),
            fault: Fault::new(kind, message),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Activity for Throw {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> ActivityResult {
        Err(self.fault.clone().into())
    }
}
