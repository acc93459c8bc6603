//! Typed extension registry handed to the executor as its host.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::CallbackError;
use crate::runtime::host::WorkflowHost;
use crate::runtime::tracking::TrackingParticipant;

/// Whether faults may be written to durable storage while they propagate.
///
/// When `persist_exceptions` is false the executor keeps the instance in a
/// no-persist zone until the fault reaches its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionPersistence {
    pub persist_exceptions: bool,
}

impl Default for ExceptionPersistence {
    fn default() -> Self {
        Self {
            persist_exceptions: true,
        }
    }
}

#[derive(Clone, Default)]
pub struct Extensions {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    participants: Vec<Arc<dyn TrackingParticipant>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, extension: Arc<T>) -> Self {
        self.insert(extension);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, extension: Arc<T>) {
        self.services.insert(TypeId::of::<T>(), extension);
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|e| e.downcast::<T>().ok())
    }

    pub fn with_tracking_participant(mut self, participant: Arc<dyn TrackingParticipant>) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn add_tracking_participant(&mut self, participant: Arc<dyn TrackingParticipant>) {
        self.participants.push(participant);
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("services", &self.services.len())
            .field("participants", &self.participants.len())
            .finish()
    }
}

impl WorkflowHost for Extensions {
    fn get_extension(&self, type_id: TypeId) -> Result<Option<Arc<dyn Any + Send + Sync>>, CallbackError> {
        Ok(self.services.get(&type_id).cloned())
    }

    fn tracking_participants(&self) -> Vec<Arc<dyn TrackingParticipant>> {
        self.participants.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_lookup_round_trips() {
        let ext = Extensions::new().with(Arc::new(ExceptionPersistence {
            persist_exceptions: false,
        }));
        let policy = ext.get::<ExceptionPersistence>().unwrap();
        assert!(!policy.persist_exceptions);
        assert!(ext.get::<String>().is_none());
        assert!(
            ext.get_extension(TypeId::of::<ExceptionPersistence>())
                .unwrap()
                .is_some()
        );
    }
}
