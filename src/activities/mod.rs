//! Built-in activities.
//!
//! A small catalog of composable activities covering control flow
//! ([`Sequence`], [`Parallel`], [`TryCatch`]), data ([`Assign`], [`Literal`],
//! [`Throw`]), external events ([`WaitForBookmark`], [`InvokeAsync`],
//! [`ExternalOperation`]) and engine scopes ([`Persist`], [`NoPersistScope`],
//! [`TransactionScope`], [`ScheduleSecondaryRoot`]).
//!
//! ```rust
//! use std::sync::Arc;
//! use duroflow::Variable;
//! use duroflow::activities::{Assign, Literal, Sequence, WaitForBookmark};
//! use serde_json::json;
//!
//! let workflow = Sequence::new("Order")
//!     .with_variable(Variable::new("total", json!(0)))
//!     .then(Assign::expression("total", Arc::new(Literal::new(json!(42)))))
//!     .then(WaitForBookmark::new("AwaitPayment", "payment"));
//! ```

mod data;
mod events;
mod flow;
mod scopes;

pub use data::{Assign, Literal, Throw};
pub use events::{ExternalOperation, InvokeAsync, WaitForBookmark};
pub use flow::{Parallel, ScheduleSecondaryRoot, Sequence};
pub use scopes::{NoPersistScope, Persist, TransactionScope, TryCatch};
