//! Durable storage for workflow instances.
//!
//! An [`InstanceStore`] keeps the latest [`WorkflowSnapshot`] of each
//! instance plus the correlation keys (bookmark scopes) that point at it.
//! Stores are plain datastores: the host decides when to save, and a save
//! requested inside an ambient transaction is staged with [`StagedSave`] so
//! that it only becomes visible if the transaction commits.

use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::WorkflowIdentity;
use crate::runtime::lock;
use crate::runtime::snapshot::WorkflowSnapshot;
use crate::runtime::transaction::{EnlistmentNotification, PreparedVote, Transaction};

pub mod error;
pub use error::{ProviderError, StoreFailure};

/// In-memory store for tests.
pub mod in_memory;
/// One JSON file per instance, for local development.
pub mod fs;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Summary row returned by [`InstanceStore::list_instances`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: Uuid,
    pub identity: WorkflowIdentity,
    pub completed: bool,
    pub saved_at_ms: u64,
}

impl InstanceInfo {
    pub(crate) fn of(snapshot: &WorkflowSnapshot) -> Self {
        Self {
            instance_id: snapshot.instance_id,
            identity: snapshot.identity.clone(),
            completed: snapshot.is_completed(),
            saved_at_ms: snapshot.saved_at_ms,
        }
    }
}

/// Storage abstraction for persisted workflow instances.
///
/// Saves overwrite the previous snapshot of the same instance. A correlation
/// key belongs to at most one instance; associating a key that another
/// instance holds is a permanent error.
#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<(), ProviderError>;

    async fn load(&self, instance: Uuid) -> Result<Option<WorkflowSnapshot>, ProviderError>;

    /// Remove an instance and its keys. Returns false if it did not exist.
    async fn delete(&self, instance: Uuid) -> Result<bool, ProviderError>;

    async fn associate_keys(&self, instance: Uuid, keys: &[Uuid]) -> Result<(), ProviderError>;

    async fn disassociate_keys(&self, keys: &[Uuid]) -> Result<(), ProviderError>;

    /// Instance currently holding `key`.
    async fn lookup_key(&self, key: Uuid) -> Result<Option<Uuid>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, ProviderError>;

    /// Save a snapshot together with its key changes.
    async fn save_with_keys(
        &self,
        snapshot: &WorkflowSnapshot,
        associate: &[Uuid],
        disassociate: &[Uuid],
    ) -> Result<(), ProviderError> {
        self.save(snapshot).await?;
        if !disassociate.is_empty() {
            self.disassociate_keys(disassociate).await?;
        }
        if !associate.is_empty() {
            self.associate_keys(snapshot.instance_id, associate).await?;
        }
        Ok(())
    }
}

/// Outcome of a staged save once its transaction finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedOutcome {
    /// Still waiting for the transaction
    Pending,
    Applied,
    Discarded,
}

struct StagedEnlistment {
    outcome: Mutex<Option<oneshot::Sender<bool>>>,
}

impl StagedEnlistment {
    fn resolve(&self, committed: bool) {
        if let Some(tx) = lock(&self.outcome).take() {
            let _ = tx.send(committed);
        }
    }
}

impl EnlistmentNotification for StagedEnlistment {
    fn prepare(&self) -> PreparedVote {
        PreparedVote::Prepared
    }

    fn commit(&self) {
        self.resolve(true);
    }

    fn rollback(&self) {
        self.resolve(false);
    }

    fn in_doubt(&self) {
        self.resolve(false);
    }
}

/// A save held back until its transaction reports an outcome.
pub struct StagedSave {
    snapshot: WorkflowSnapshot,
    associate: Vec<Uuid>,
    disassociate: Vec<Uuid>,
    outcome: oneshot::Receiver<bool>,
}

impl std::fmt::Debug for StagedSave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedSave")
            .field("instance_id", &self.snapshot.instance_id)
            .finish()
    }
}

impl StagedSave {
    /// Enlist in `transaction` and hold `snapshot` until it finishes.
    pub fn stage(
        snapshot: WorkflowSnapshot,
        associate: Vec<Uuid>,
        disassociate: Vec<Uuid>,
        transaction: &Arc<dyn Transaction>,
    ) -> Result<Self, ProviderError> {
        let (tx, rx) = oneshot::channel();
        let enlistment = Arc::new(StagedEnlistment {
            outcome: Mutex::new(Some(tx)),
        });
        transaction
            .enlist_volatile(enlistment)
            .map_err(|fault| ProviderError::staging(fault.message))?;
        Ok(Self {
            snapshot,
            associate,
            disassociate,
            outcome: rx,
        })
    }

    /// Write the snapshot if the transaction committed. Never waits.
    pub async fn try_apply(&mut self, store: &dyn InstanceStore) -> Result<StagedOutcome, ProviderError> {
        match self.outcome.try_recv() {
            Ok(true) => {
                store
                    .save_with_keys(&self.snapshot, &self.associate, &self.disassociate)
                    .await?;
                Ok(StagedOutcome::Applied)
            }
            Ok(false) | Err(oneshot::error::TryRecvError::Closed) => Ok(StagedOutcome::Discarded),
            Err(oneshot::error::TryRecvError::Empty) => Ok(StagedOutcome::Pending),
        }
    }
}
