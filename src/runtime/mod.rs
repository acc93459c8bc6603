//! The execution engine.
//!
//! [`ActivityExecutor`] owns one workflow instance and drives it through a
//! cooperative [`scheduler`]. Everything that needs the outside world
//! (persistence, transaction outcomes, asynchronous work) is surfaced as a
//! [`HostRequest`]; [`application::WorkflowApplication`] is the tokio host
//! that services them against an [`crate::providers::InstanceStore`].

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod application;
pub mod async_operation;
pub mod bookmarks;
pub mod context;
pub mod dynamic_update;
pub mod environment;
mod executor;
pub mod extensions;
pub mod host;
pub mod instance;
pub mod location;
pub mod observability;
pub mod properties;
pub mod scheduler;
pub mod snapshot;
pub mod tracking;
pub mod transaction;
pub mod work_item;

pub use application::{
    PersistableIdleAction, RuntimeOptions, UnhandledExceptionAction, WorkflowApplication, WorkflowStatus,
};
pub use async_operation::{
    AsyncOperationContext, AsyncWork, InlineSynchronizationContext, SynchronizationContext, TokioSynchronizationContext,
};
pub use bookmarks::{Bookmark, BookmarkOptions, BookmarkResumptionResult};
pub use context::ActivityContext;
pub use dynamic_update::{DynamicUpdateMap, DynamicUpdateMapBuilder, UpdateContext};
pub use environment::EnvironmentUpdateMap;
pub use executor::{
    ActivityExecutor, ExecutorSettings, HostRequest, MappableLocation, PersistenceWaiter, TransactionContextWaiter,
};
pub use extensions::{ExceptionPersistence, Extensions};
pub use host::WorkflowHost;
pub use instance::ActivityInstanceState;
pub use observability::{LogFormat, MetricsProvider, MetricsSnapshot, ObservabilityConfig, ObservabilityHandle};
pub use properties::{ExecutionProperties, WorkflowThreadProperty};
pub use scheduler::SchedulerOutcome;
pub use snapshot::WorkflowSnapshot;
pub use tracking::{TrackingParticipant, TrackingRecord, WorkflowInstanceEvent};
pub use transaction::{LocalTransaction, Transaction, TransactionMessage, TransactionStatus};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
