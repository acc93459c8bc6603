//! The ambient runtime transaction: context requests, enlistment,
//! persist-before-commit and outcome handling.

use std::sync::{Arc, Mutex};

use super::persistence::SnapshotPatch;
use super::{ActivityExecutor, HostRequest, InFlightStage, TransactionContextWaiter};
use crate::errors::{ActivityResult, ErrorDetails, Fault, WorkflowError};
use crate::ids::{InstanceId, OperationId};
use crate::runtime::lock;
use crate::runtime::transaction::{RuntimeTransactionData, Transaction, TransactionEnlistment, TransactionMessage};
use crate::runtime::work_item::{ContinuationReason, WorkItem, WorkItemKind};

impl ActivityExecutor {
    /// Queue a request for the transaction context. A `requires` request
    /// jumps the queue and holds a no-persist zone until it is serviced.
    pub(crate) fn request_transaction_context(&mut self, instance: InstanceId, callback: &str, requires: bool) {
        let waiter = TransactionContextWaiter {
            instance,
            callback: callback.to_string(),
            requires,
        };
        if requires {
            self.enter_no_persist();
            self.transaction_context_waiters.push_front(waiter);
        } else {
            self.transaction_context_waiters.push_back(waiter);
        }
        if let Some(i) = self.instances.get_mut(instance) {
            i.increment_busy_count();
            i.waiting_for_transaction_context = true;
        }
    }

    pub(crate) fn set_runtime_transaction(
        &mut self,
        scope: InstanceId,
        transaction: Arc<dyn Transaction>,
        abort_instance_on_failure: bool,
    ) -> ActivityResult {
        if self.isolation_scope().is_some() {
            return Err(WorkflowError::invalid_operation("a runtime transaction is already active").into());
        }
        let data = RuntimeTransactionData::new(transaction.clone(), scope, abort_instance_on_failure);
        *lock(&self.runtime_transaction) = Some(Arc::new(Mutex::new(data)));
        let (enlistment, mailbox) = TransactionEnlistment::new(self.runtime_transaction.clone());
        if let Err(fault) = transaction.enlist_volatile(enlistment) {
            *lock(&self.runtime_transaction) = None;
            return Err(fault.into());
        }
        self.transaction_mailbox = Some(mailbox);
        self.enter_no_persist();
        tracing::debug!(
            target: "duroflow::runtime",
            instance = %scope,
            transaction = %transaction.id(),
            "runtime transaction set"
        );
        Ok(())
    }

    /// Ask for the active transaction to be completed.
    ///
    /// Only the isolation scope drives the commit. A nested scope that joined
    /// the transaction gets its continuation right away.
    pub(crate) fn request_transaction_completion(
        &mut self,
        caller: InstanceId,
        callback: Option<&str>,
    ) -> Result<(), WorkflowError> {
        let data = lock(&self.runtime_transaction)
            .clone()
            .ok_or_else(|| WorkflowError::invalid_operation("no runtime transaction is active"))?;
        let scope = lock(&data).isolation_scope;
        if scope != caller {
            if let Some(callback) = callback {
                if let Some(i) = self.instances.get_mut(caller) {
                    i.increment_busy_count();
                }
                self.scheduler.push_work(WorkItem::new(
                    caller,
                    WorkItemKind::Continuation {
                        callback: callback.to_string(),
                        reason: ContinuationReason::TransactionCompleted,
                    },
                ));
            }
            return Ok(());
        }

        {
            let mut d = lock(&data);
            if d.should_schedule_completion || d.completion_callback.is_some() {
                return Err(WorkflowError::invalid_operation("transaction completion was already requested"));
            }
            d.completion_callback = callback.map(str::to_string);
            d.should_schedule_completion = true;
        }
        if callback.is_some()
            && let Some(i) = self.instances.get_mut(caller)
        {
            i.increment_busy_count();
        }
        Ok(())
    }

    /// When the isolation scope runs out of work it waits for the commit
    /// instead of closing.
    pub(crate) fn is_completing_transaction(&mut self, id: InstanceId) -> bool {
        let Some(data) = lock(&self.runtime_transaction).clone() else {
            return false;
        };
        {
            let mut d = lock(&data);
            if d.isolation_scope != id {
                return false;
            }
            d.should_schedule_completion = true;
        }
        self.scheduler.push_work(WorkItem::empty(id));
        true
    }

    pub(crate) fn schedule_transaction_completion(&mut self) {
        let Some(data) = lock(&self.runtime_transaction).clone() else {
            return;
        };
        let scope = {
            let mut d = lock(&data);
            if !d.should_schedule_completion || d.completion_scheduled {
                return;
            }
            d.completion_scheduled = true;
            d.isolation_scope
        };
        self.scheduler
            .push_work(WorkItem::new(scope, WorkItemKind::CompleteTransaction));
    }

    pub(super) fn execute_complete_transaction(
        &mut self,
        item: &mut WorkItem,
    ) -> ActivityResult<Option<(OperationId, InFlightStage)>> {
        let Some(data) = lock(&self.runtime_transaction).clone() else {
            return Ok(None);
        };

        if self.settings.persist_before_commit
            && let Some(waiter) = self.persistence_waiters.pop_front()
        {
            self.scheduler.push_work(WorkItem::new(
                waiter.instance,
                WorkItemKind::Continuation {
                    callback: waiter.callback,
                    reason: ContinuationReason::Persisted,
                },
            ));
            let (scope, callback, original) = {
                let d = lock(&data);
                (d.isolation_scope, d.completion_callback.clone(), d.original.clone())
            };
            // the saved state must look as if the commit already happened
            let after_commit = match callback {
                Some(callback) => WorkItem::new(
                    scope,
                    WorkItemKind::Continuation {
                        callback,
                        reason: ContinuationReason::TransactionCompleted,
                    },
                ),
                None => WorkItem::empty(scope),
            };
            let operation = self.allocate_operation();
            let (associate_keys, disassociate_keys) = self.scopes.take_key_changes();
            let snapshot = self.build_snapshot(Some(SnapshotPatch {
                extra_work: vec![after_commit],
                released_no_persist: 1,
            }));
            self.host_requests.push(HostRequest::Persist {
                operation,
                snapshot: Box::new(snapshot),
                transaction: Some(original),
                associate_keys,
                disassociate_keys,
            });
            return Ok(Some((operation, InFlightStage::PersistBeforeCommit)));
        }

        Ok(self
            .commit_transaction(item)
            .map(|operation| (operation, InFlightStage::AwaitTransactionOutcome)))
    }

    /// Commit if the engine may, otherwise ask the host to wait for the
    /// outcome. Returns the operation to wait on in the latter case.
    pub(crate) fn commit_transaction(&mut self, item: &mut WorkItem) -> Option<OperationId> {
        let data = lock(&self.runtime_transaction).clone()?;
        let internal = {
            let mut d = lock(&data);
            d.is_completing = true;
            d.internal.clone()
        };

        if internal.is_committable() {
            let outcome = match internal.commit() {
                Ok(()) => self
                    .transaction_mailbox
                    .as_mut()
                    .and_then(|m| m.try_recv().ok())
                    .or(Some(TransactionMessage::Committed)),
                Err(fault) => {
                    tracing::warn!(target: "duroflow::runtime", error = %fault, "transaction commit failed");
                    Some(TransactionMessage::Aborted)
                }
            };
            self.finish_transaction(item, outcome);
            return None;
        }

        if let Some(message) = self.transaction_mailbox.as_mut().and_then(|m| m.try_recv().ok()) {
            self.finish_transaction(item, Some(message));
            return None;
        }
        let Some(receiver) = self.transaction_mailbox.take() else {
            self.finish_transaction(item, None);
            return None;
        };
        let operation = self.allocate_operation();
        self.host_requests.push(HostRequest::AwaitTransactionOutcome {
            operation,
            receiver,
            timeout: self.settings.transaction_completion_timeout,
        });
        Some(operation)
    }

    /// Apply a transaction outcome. `None` means nobody reported one in time.
    pub(crate) fn finish_transaction(&mut self, item: &mut WorkItem, outcome: Option<TransactionMessage>) {
        let Some(data) = lock(&self.runtime_transaction).take() else {
            return;
        };
        self.transaction_mailbox = None;
        let (scope, callback, abort_on_failure, internal) = {
            let d = lock(&data);
            (
                d.isolation_scope,
                d.completion_callback.clone(),
                d.abort_instance_on_failure,
                d.internal.clone(),
            )
        };
        self.exit_no_persist();

        match outcome {
            Some(TransactionMessage::Committed) => {
                if let Some(m) = &self.metrics {
                    m.record_transaction_committed();
                }
                tracing::debug!(target: "duroflow::runtime", instance = %scope, "transaction committed");
                let next = match callback {
                    Some(callback) => WorkItem::new(
                        scope,
                        WorkItemKind::Continuation {
                            callback,
                            reason: ContinuationReason::TransactionCompleted,
                        },
                    ),
                    None => WorkItem::empty(scope),
                };
                self.scheduler.push_work(next);
            }
            other => {
                let message = match other {
                    Some(TransactionMessage::InDoubt) => "transaction outcome is in doubt",
                    None => "timed out waiting for the transaction outcome",
                    _ => "transaction aborted",
                };
                if other.is_none() {
                    internal.rollback(message);
                }
                if let Some(m) = &self.metrics {
                    m.record_transaction_rolled_back();
                }
                tracing::warn!(target: "duroflow::runtime", instance = %scope, reason = message, "transaction failed");
                if callback.is_some()
                    && let Some(i) = self.instances.get_mut(scope)
                {
                    i.decrement_busy_count();
                }
                let fault = Fault::transaction_aborted(message);
                if abort_on_failure {
                    item.workflow_abort = Some(ErrorDetails::Application(fault));
                } else {
                    item.exception_to_propagate = Some(fault);
                }
            }
        }
        self.run_pending_root_cancel();
    }

    pub(crate) fn rollback_transaction(&mut self, reason: &str) {
        let Some(data) = lock(&self.runtime_transaction).take() else {
            return;
        };
        self.transaction_mailbox = None;
        let internal = lock(&data).internal.clone();
        internal.rollback(reason);
        if let Some(m) = &self.metrics {
            m.record_transaction_rolled_back();
        }
        self.exit_no_persist();
    }

    /// Roll back the transaction when its isolation scope is torn down.
    pub(crate) fn terminate_special_execution_blocks(&mut self, id: InstanceId, reason: &Fault) {
        let Some(data) = lock(&self.runtime_transaction).clone() else {
            return;
        };
        let (scope, abort_on_failure) = {
            let d = lock(&data);
            (d.isolation_scope, d.abort_instance_on_failure)
        };
        if scope != id {
            return;
        }
        self.rollback_transaction(&reason.message);
        if abort_on_failure {
            self.abort_workflow_instance(ErrorDetails::Application(
                Fault::transaction_aborted(format!("isolation scope {id} faulted")).with_inner(reason.clone()),
            ));
        }
        self.run_pending_root_cancel();
    }

    fn run_pending_root_cancel(&mut self) {
        if !self.is_root_cancel_pending || self.abort_reason.is_some() {
            return;
        }
        self.is_root_cancel_pending = false;
        if let Some(root) = self.root {
            self.cancel_activity(root);
        }
    }
}
