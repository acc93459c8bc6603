use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Value;
use crate::activity::HandleKind;
use crate::ids::{EnvironmentId, InstanceId};

/// Address of a location inside an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocationRef {
    pub environment: EnvironmentId,
    pub ordinal: usize,
}

/// Runtime state of a handle variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleState {
    NoPersist {
        owner: InstanceId,
        entered: bool,
    },
    BookmarkScope {
        owner: InstanceId,
        scope: Option<Uuid>,
    },
    RuntimeTransaction {
        owner: InstanceId,
    },
}

impl HandleState {
    pub(crate) fn initialize(kind: HandleKind, owner: InstanceId) -> Self {
        match kind {
            HandleKind::NoPersist => HandleState::NoPersist { owner, entered: false },
            HandleKind::BookmarkScope => HandleState::BookmarkScope { owner, scope: None },
            HandleKind::RuntimeTransaction => HandleState::RuntimeTransaction { owner },
        }
    }

    pub fn kind(&self) -> HandleKind {
        match self {
            HandleState::NoPersist { .. } => HandleKind::NoPersist,
            HandleState::BookmarkScope { .. } => HandleKind::BookmarkScope,
            HandleState::RuntimeTransaction { .. } => HandleKind::RuntimeTransaction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocationKind {
    Plain,
    /// Target of an argument expression that has not finished yet. The
    /// expression writes into the inner location; resolution collapses it.
    Temporary(Box<Location>),
    Handle(HandleState),
}

/// A single argument or variable storage cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub value: Value,
    pub mappable: bool,
    pub kind: LocationKind,
}

impl Location {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            mappable: false,
            kind: LocationKind::Plain,
        }
    }

    pub fn handle(name: impl Into<String>, state: HandleState) -> Self {
        Self {
            name: name.into(),
            value: Value::Null,
            mappable: false,
            kind: LocationKind::Handle(state),
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self.kind, LocationKind::Temporary(_))
    }

    pub fn handle_state(&self) -> Option<&HandleState> {
        match &self.kind {
            LocationKind::Handle(state) => Some(state),
            _ => None,
        }
    }

    pub fn handle_state_mut(&mut self) -> Option<&mut HandleState> {
        match &mut self.kind {
            LocationKind::Handle(state) => Some(state),
            _ => None,
        }
    }

    /// Start waiting on an expression result.
    pub(crate) fn make_temporary(&mut self) {
        let inner = Location::new(self.name.clone(), Value::Null);
        self.kind = LocationKind::Temporary(Box::new(inner));
    }

    /// Write an expression result. Temporary locations receive it in their
    /// inner cell.
    pub(crate) fn set_resolved(&mut self, value: Value) {
        match &mut self.kind {
            LocationKind::Temporary(inner) => inner.value = value,
            _ => self.value = value,
        }
    }

    /// Fold a finished temporary back into a plain value.
    pub(crate) fn collapse(&mut self) {
        if !self.is_temporary() {
            return;
        }
        if let LocationKind::Temporary(inner) = std::mem::replace(&mut self.kind, LocationKind::Plain) {
            self.value = inner.value;
        }
    }
}
