//! Live activity instances and the arena that owns them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::Value;
use crate::errors::WorkflowError;
use crate::ids::{ActivityId, EnvironmentId, InstanceId};
use crate::runtime::location::LocationRef;
use crate::runtime::properties::ExecutionProperties;

/// Lifecycle state of an activity instance.
///
/// `Executing` may move to `Canceling` once cancellation is requested. The
/// three completed states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityInstanceState {
    Executing,
    Canceling,
    Closed,
    Canceled,
    Faulted,
}

impl ActivityInstanceState {
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            ActivityInstanceState::Closed | ActivityInstanceState::Canceled | ActivityInstanceState::Faulted
        )
    }
}

impl std::fmt::Display for ActivityInstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Progress before the activity body runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Substate {
    Created,
    ResolvingArguments,
    Executing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInstance {
    pub id: InstanceId,
    pub activity: ActivityId,
    pub state: ActivityInstanceState,
    pub(crate) substate: Substate,
    pub parent: Option<InstanceId>,
    pub children: BTreeSet<InstanceId>,
    /// Position in the parent's declared children when scheduled as one
    pub child_index: Option<usize>,
    pub environment: Option<EnvironmentId>,
    pub owns_environment: bool,
    /// Parent continuation fired when this instance completes
    pub completion_callback: Option<String>,
    /// Parent continuation fired when a fault escapes this instance
    pub fault_callback: Option<String>,
    pub is_cancellation_requested: bool,
    pub(crate) performing_default_cancelation: bool,
    pub(crate) marked_canceled: bool,
    pub(crate) busy_count: u32,
    pub(crate) blocking_bookmark_count: u32,
    pub(crate) waiting_for_transaction_context: bool,
    pub(crate) next_argument_index: usize,
    pub result: Option<Value>,
    /// Where an expression instance writes its result
    pub result_location: Option<LocationRef>,
    pub is_secondary_root: bool,
    #[serde(default, skip_serializing_if = "ExecutionProperties::is_empty")]
    pub(crate) properties: ExecutionProperties,
}

impl ActivityInstance {
    pub(crate) fn new(id: InstanceId, activity: ActivityId, parent: Option<InstanceId>) -> Self {
        Self {
            id,
            activity,
            state: ActivityInstanceState::Executing,
            substate: Substate::Created,
            parent,
            children: BTreeSet::new(),
            child_index: None,
            environment: None,
            owns_environment: false,
            completion_callback: None,
            fault_callback: None,
            is_cancellation_requested: false,
            performing_default_cancelation: false,
            marked_canceled: false,
            busy_count: 0,
            blocking_bookmark_count: 0,
            waiting_for_transaction_context: false,
            next_argument_index: 0,
            result: None,
            result_location: None,
            is_secondary_root: false,
            properties: ExecutionProperties::default(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    pub fn has_executed(&self) -> bool {
        self.substate == Substate::Executing
    }

    /// Anything that keeps the instance from completing.
    pub fn has_pending_work(&self) -> bool {
        !self.children.is_empty()
            || self.busy_count > 0
            || self.blocking_bookmark_count > 0
            || self.waiting_for_transaction_context
    }

    pub fn busy_count(&self) -> u32 {
        self.busy_count
    }

    pub fn blocking_bookmark_count(&self) -> u32 {
        self.blocking_bookmark_count
    }

    pub(crate) fn increment_busy_count(&mut self) {
        self.busy_count += 1;
    }

    pub(crate) fn decrement_busy_count(&mut self) {
        self.busy_count = self.busy_count.saturating_sub(1);
    }

    /// State to close with once nothing is pending.
    pub(crate) fn closing_state(&self) -> ActivityInstanceState {
        if self.marked_canceled || (self.is_cancellation_requested && self.performing_default_cancelation) {
            ActivityInstanceState::Canceled
        } else if self.is_cancellation_requested && !self.has_executed() {
            ActivityInstanceState::Canceled
        } else {
            ActivityInstanceState::Closed
        }
    }
}

/// Arena of live instances.
///
/// Completed instances are retired rather than removed immediately so that a
/// fault propagating through them can still follow their parent links. The
/// executor flushes retirements at the end of every work item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceMap {
    instances: BTreeMap<InstanceId, ActivityInstance>,
    next_id: u64,
    #[serde(skip)]
    retired: Vec<InstanceId>,
}

impl InstanceMap {
    pub(crate) fn allocate_id(&mut self) -> Result<InstanceId, WorkflowError> {
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| WorkflowError::invalid_operation("out of instance ids"))?;
        Ok(InstanceId(self.next_id))
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&mut self, next: u64) {
        self.next_id = next;
    }

    pub(crate) fn insert(&mut self, instance: ActivityInstance) {
        self.instances.insert(instance.id, instance);
    }

    pub fn get(&self, id: InstanceId) -> Option<&ActivityInstance> {
        self.instances.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: InstanceId) -> Option<&mut ActivityInstance> {
        self.instances.get_mut(&id)
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActivityInstance> {
        self.instances.values()
    }

    /// Live (not completed) instances.
    pub fn live(&self) -> impl Iterator<Item = &ActivityInstance> {
        self.instances.values().filter(|i| !i.is_completed())
    }

    /// `root` and its descendants, children before parents.
    pub fn post_order(&self, root: InstanceId) -> Vec<InstanceId> {
        let mut out = Vec::new();
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            let Some(instance) = self.instances.get(&id) else {
                continue;
            };
            stack.push((id, true));
            for child in instance.children.iter().rev() {
                stack.push((*child, false));
            }
        }
        out
    }

    /// Whether `ancestor` is `id` or one of its ancestors.
    pub fn is_in_subtree(&self, ancestor: InstanceId, id: InstanceId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.instances.get(&current).and_then(|i| i.parent);
        }
        false
    }

    pub(crate) fn retire(&mut self, id: InstanceId) {
        if !self.retired.contains(&id) {
            self.retired.push(id);
        }
    }

    /// Remove retired instances. Returns how many were removed.
    pub(crate) fn flush_retired(&mut self) -> usize {
        let retired = std::mem::take(&mut self.retired);
        retired
            .into_iter()
            .filter(|id| self.instances.remove(id).is_some())
            .count()
    }
}
