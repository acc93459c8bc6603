//! Bridging host-asynchronous work into the scheduler's completion model.
//!
//! An activity that starts asynchronous work gets an [`AsyncOperationContext`].
//! While it is outstanding the owner stays busy and the instance cannot
//! persist. The host runs the work and hands the result back, which the
//! executor routes to the owner as a `CompleteAsyncOperation` work item.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Value;
use crate::errors::Fault;
use crate::ids::{InstanceId, OperationId};

/// Work an activity hands to the host.
pub type AsyncWork = BoxFuture<'static, Result<Value, Fault>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncOperationContext {
    pub id: OperationId,
    pub owner: InstanceId,
    pub callback: String,
}

/// Where the host runs the executor and the work it requests.
///
/// `operation_started`/`operation_completed` bracket every outstanding
/// operation so the host can tell whether work is still in flight while the
/// scheduler is not running.
pub trait SynchronizationContext: Send + Sync {
    fn post(&self, work: BoxFuture<'static, ()>);

    fn operation_started(&self) {}

    fn operation_completed(&self) {}

    fn outstanding_operations(&self) -> usize {
        0
    }
}

/// Posts onto a tokio runtime.
#[derive(Debug)]
pub struct TokioSynchronizationContext {
    handle: tokio::runtime::Handle,
    outstanding: AtomicUsize,
}

impl TokioSynchronizationContext {
    /// Bind to the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            outstanding: AtomicUsize::new(0),
        }
    }
}

impl SynchronizationContext for TokioSynchronizationContext {
    fn post(&self, work: BoxFuture<'static, ()>) {
        self.handle.spawn(work);
    }

    fn operation_started(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn operation_completed(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn outstanding_operations(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// Runs posted work to completion on the posting thread.
///
/// Suitable only for work that does not depend on a reactor.
#[derive(Debug, Default)]
pub struct InlineSynchronizationContext {
    outstanding: AtomicUsize,
}

impl SynchronizationContext for InlineSynchronizationContext {
    fn post(&self, work: BoxFuture<'static, ()>) {
        futures::executor::block_on(work);
    }

    fn operation_started(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn operation_completed(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn outstanding_operations(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}
