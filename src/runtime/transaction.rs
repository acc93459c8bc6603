//! Ambient transactions and the executor's enlistment in them.
//!
//! At most one transaction is active per workflow instance. The executor
//! keeps it in a shared [`RuntimeTransactionSlot`] because enlistment
//! callbacks may arrive on a transaction-manager thread while the workflow
//! runs other work. Callbacks snapshot the slot before locking the data and
//! report outcomes through a [`TransactionMessage`] mailbox drained on the
//! workflow's logical thread.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use uuid::Uuid;

use crate::errors::Fault;
use crate::ids::InstanceId;
use crate::runtime::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
    InDoubt,
}

/// An enlistment's answer to the prepare phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparedVote {
    Prepared,
    ForceRollback,
    /// Read-only participant; receives no further notifications
    Done,
}

pub trait EnlistmentNotification: Send + Sync {
    fn prepare(&self) -> PreparedVote;
    fn commit(&self);
    fn rollback(&self);
    fn in_doubt(&self);
}

pub trait Transaction: Send + Sync {
    fn id(&self) -> Uuid;
    fn status(&self) -> TransactionStatus;
    fn enlist_volatile(&self, enlistment: Arc<dyn EnlistmentNotification>) -> Result<(), Fault>;
    /// Whether the engine may drive the commit. Host-owned transactions
    /// return false and the executor waits for their outcome instead.
    fn is_committable(&self) -> bool;
    fn commit(&self) -> Result<(), Fault>;
    fn rollback(&self, reason: &str);
}

struct LocalTransactionState {
    status: TransactionStatus,
    enlistments: Vec<Arc<dyn EnlistmentNotification>>,
}

/// In-process two-phase transaction.
///
/// Enlistments are never notified while the state lock is held, so they may
/// call back into the transaction.
pub struct LocalTransaction {
    id: Uuid,
    state: Mutex<LocalTransactionState>,
}

impl LocalTransaction {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            state: Mutex::new(LocalTransactionState {
                status: TransactionStatus::Active,
                enlistments: Vec::new(),
            }),
        })
    }

    fn finish(&self, status: TransactionStatus) -> Option<Vec<Arc<dyn EnlistmentNotification>>> {
        let mut state = lock(&self.state);
        if state.status != TransactionStatus::Active {
            return None;
        }
        state.status = status;
        Some(std::mem::take(&mut state.enlistments))
    }
}

fn identity(enlistment: &Arc<dyn EnlistmentNotification>) -> *const () {
    Arc::as_ptr(enlistment).cast()
}

impl std::fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Transaction for LocalTransaction {
    fn id(&self) -> Uuid {
        self.id
    }

    fn status(&self) -> TransactionStatus {
        lock(&self.state).status
    }

    fn enlist_volatile(&self, enlistment: Arc<dyn EnlistmentNotification>) -> Result<(), Fault> {
        let mut state = lock(&self.state);
        if state.status != TransactionStatus::Active {
            return Err(Fault::transaction_aborted(format!(
                "transaction {} is no longer active",
                self.id
            )));
        }
        state.enlistments.push(enlistment);
        Ok(())
    }

    fn is_committable(&self) -> bool {
        true
    }

    fn commit(&self) -> Result<(), Fault> {
        let enlistments = {
            let state = lock(&self.state);
            if state.status != TransactionStatus::Active {
                return Err(Fault::transaction_aborted(format!(
                    "transaction {} already finished as {:?}",
                    self.id, state.status
                )));
            }
            state.enlistments.clone()
        };

        // participants that take no part in phase two
        let mut finished = Vec::new();
        let mut rollback = false;
        for enlistment in &enlistments {
            match enlistment.prepare() {
                PreparedVote::Prepared => {}
                PreparedVote::Done => finished.push(identity(enlistment)),
                PreparedVote::ForceRollback => {
                    finished.push(identity(enlistment));
                    rollback = true;
                    break;
                }
            }
        }

        let status = if rollback {
            TransactionStatus::Aborted
        } else {
            TransactionStatus::Committed
        };
        let notified = self
            .finish(status)
            .unwrap_or_default()
            .into_iter()
            .filter(|e| !finished.contains(&identity(e)));
        if rollback {
            for enlistment in notified {
                enlistment.rollback();
            }
            return Err(Fault::transaction_aborted(format!(
                "transaction {} was rolled back by a participant",
                self.id
            )));
        }
        for enlistment in notified {
            enlistment.commit();
        }
        Ok(())
    }

    fn rollback(&self, reason: &str) {
        let Some(enlistments) = self.finish(TransactionStatus::Aborted) else {
            return;
        };
        tracing::debug!(transaction = %self.id, reason, "transaction rolled back");
        for enlistment in enlistments {
            enlistment.rollback();
        }
    }
}

/// Outcome notifications posted by the executor's enlistment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMessage {
    Committed,
    Aborted,
    InDoubt,
}

/// The one ambient transaction of a workflow instance.
pub(crate) struct RuntimeTransactionData {
    pub(crate) original: Arc<dyn Transaction>,
    /// Handle the engine uses; shares state with `original`
    pub(crate) internal: Arc<dyn Transaction>,
    pub(crate) isolation_scope: InstanceId,
    /// The isolation scope asked for completion
    pub(crate) should_schedule_completion: bool,
    pub(crate) completion_scheduled: bool,
    pub(crate) completion_callback: Option<String>,
    pub(crate) abort_instance_on_failure: bool,
    /// Set right before commit; until then the enlistment refuses to prepare
    pub(crate) is_completing: bool,
}

impl RuntimeTransactionData {
    pub(crate) fn new(transaction: Arc<dyn Transaction>, isolation_scope: InstanceId, abort_instance_on_failure: bool) -> Self {
        Self {
            internal: transaction.clone(),
            original: transaction,
            isolation_scope,
            should_schedule_completion: false,
            completion_scheduled: false,
            completion_callback: None,
            abort_instance_on_failure,
            is_completing: false,
        }
    }
}

/// Slot holding the active transaction. The executor clears it on
/// completion while enlistment callbacks may still be in flight.
pub(crate) type RuntimeTransactionSlot = Arc<Mutex<Option<Arc<Mutex<RuntimeTransactionData>>>>>;

/// The executor's volatile enlistment.
pub(crate) struct TransactionEnlistment {
    slot: RuntimeTransactionSlot,
    mailbox: UnboundedSender<TransactionMessage>,
}

impl TransactionEnlistment {
    pub(crate) fn new(slot: RuntimeTransactionSlot) -> (Arc<Self>, UnboundedReceiver<TransactionMessage>) {
        let (mailbox, receiver) = unbounded_channel();
        (Arc::new(Self { slot, mailbox }), receiver)
    }

    fn snapshot(&self) -> Option<Arc<Mutex<RuntimeTransactionData>>> {
        lock(&self.slot).clone()
    }

    fn post(&self, message: TransactionMessage) {
        // receiver gone means the executor already moved on
        let _ = self.mailbox.send(message);
    }
}

impl EnlistmentNotification for TransactionEnlistment {
    fn prepare(&self) -> PreparedVote {
        let Some(data) = self.snapshot() else {
            return PreparedVote::Done;
        };
        let completing = lock(&data).is_completing;
        if completing {
            PreparedVote::Prepared
        } else {
            tracing::warn!("transaction committed before its isolation scope completed");
            PreparedVote::ForceRollback
        }
    }

    fn commit(&self) {
        self.post(TransactionMessage::Committed);
    }

    fn rollback(&self) {
        self.post(TransactionMessage::Aborted);
    }

    fn in_doubt(&self) {
        self.post(TransactionMessage::InDoubt);
    }
}
