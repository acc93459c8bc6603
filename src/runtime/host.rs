//! The contract between the executor and whoever hosts it.

use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::errors::{CallbackError, ErrorDetails, Fault};
use crate::ids::InstanceId;
use crate::runtime::instance::ActivityInstanceState;
use crate::runtime::tracking::TrackingParticipant;

/// Host callbacks invoked from the scheduler-idle path.
///
/// Notifications may arrive on a thread other than the one that last ran
/// workflow code. Errors returned from them are infrastructure failures and
/// abort the instance; `on_request_abort` failures are only logged because
/// the instance is already aborting.
pub trait WorkflowHost: Send + Sync {
    fn notify_paused(&self) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Raised once when every root has completed, before completion is
    /// reported through the run outcome.
    fn notify_main_body_complete(&self, state: ActivityInstanceState) -> Result<(), CallbackError> {
        let _ = state;
        Ok(())
    }

    fn notify_unhandled_exception(&self, fault: &Fault, source: InstanceId) -> Result<(), CallbackError> {
        let _ = (fault, source);
        Ok(())
    }

    fn on_request_abort(&self, reason: &ErrorDetails) -> Result<(), CallbackError> {
        let _ = reason;
        Ok(())
    }

    /// Service lookup for ambient extensions.
    fn get_extension(&self, type_id: TypeId) -> Result<Option<Arc<dyn Any + Send + Sync>>, CallbackError>;

    fn tracking_participants(&self) -> Vec<Arc<dyn TrackingParticipant>> {
        Vec::new()
    }
}
