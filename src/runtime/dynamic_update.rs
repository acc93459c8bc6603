//! Migrating a running instance to a new definition.
//!
//! A [`DynamicUpdateMap`] says, for every activity of the old definition,
//! which activity of the new definition takes over its live instances and how
//! its environment is remapped. Activities the map does not mention keep their
//! id, and their environments are matched by symbol name.

use std::collections::BTreeMap;

use crate::Value;
use crate::definition::{ActivityNode, ActivityTable, SymbolCategory};
use crate::errors::WorkflowError;
use crate::ids::{ActivityId, InstanceId};
use crate::runtime::environment::EnvironmentUpdateMap;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DynamicUpdateMapEntry {
    /// `None` when the activity was removed
    pub new_activity: Option<ActivityId>,
    /// Explicit environment remapping; derived by name when absent
    pub environment: Option<EnvironmentUpdateMap>,
    /// Live instances of this activity prevent the update
    pub blocking_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DynamicUpdateMap {
    entries: BTreeMap<ActivityId, DynamicUpdateMapEntry>,
}

/// The effective mapping of one old activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedEntry {
    pub(crate) new_activity: Option<ActivityId>,
    pub(crate) environment: Option<EnvironmentUpdateMap>,
    pub(crate) blocking_reason: Option<String>,
}

impl DynamicUpdateMap {
    pub fn builder() -> DynamicUpdateMapBuilder {
        DynamicUpdateMapBuilder::default()
    }

    /// Map every old activity to the new activity at the same position in the
    /// tree. Activities with no counterpart are treated as removed.
    pub fn match_by_path(old: &ActivityTable, new: &ActivityTable) -> Self {
        let entries = old
            .iter()
            .map(|node| {
                let new_activity = old.path(node.id).and_then(|p| new.find_by_path(&p));
                (
                    node.id,
                    DynamicUpdateMapEntry {
                        new_activity,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn entry(&self, old: ActivityId) -> Option<&DynamicUpdateMapEntry> {
        self.entries.get(&old)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn resolve(&self, old: ActivityId, old_table: &ActivityTable, new_table: &ActivityTable) -> ResolvedEntry {
        let (new_activity, environment, blocking_reason) = match self.entries.get(&old) {
            Some(entry) => (entry.new_activity, entry.environment.clone(), entry.blocking_reason.clone()),
            None => (new_table.get(old).map(|n| n.id), None, None),
        };
        let environment = environment.or_else(|| {
            let old_node = old_table.get(old)?;
            let new_node = new_table.get(new_activity?)?;
            Some(EnvironmentUpdateMap::between(&old_node.layout, &new_node.layout))
        });
        ResolvedEntry {
            new_activity,
            environment,
            blocking_reason,
        }
    }
}

#[derive(Debug, Default)]
pub struct DynamicUpdateMapBuilder {
    entries: BTreeMap<ActivityId, DynamicUpdateMapEntry>,
}

impl DynamicUpdateMapBuilder {
    pub fn map(mut self, old: ActivityId, new: ActivityId) -> Self {
        self.entries.entry(old).or_default().new_activity = Some(new);
        self
    }

    pub fn remove(mut self, old: ActivityId) -> Self {
        self.entries.entry(old).or_default().new_activity = None;
        self
    }

    pub fn block(mut self, old: ActivityId, reason: impl Into<String>) -> Self {
        let entry = self.entries.entry(old).or_insert_with(|| DynamicUpdateMapEntry {
            new_activity: Some(old),
            ..Default::default()
        });
        entry.blocking_reason = Some(reason.into());
        self
    }

    pub fn environment(mut self, old: ActivityId, map: EnvironmentUpdateMap) -> Self {
        let entry = self.entries.entry(old).or_insert_with(|| DynamicUpdateMapEntry {
            new_activity: Some(old),
            ..Default::default()
        });
        entry.environment = Some(map);
        self
    }

    pub fn build(self) -> DynamicUpdateMap {
        DynamicUpdateMap { entries: self.entries }
    }
}

/// What an activity sees of its live instance while an update is prepared.
///
/// Writes are staged and only applied if every instance accepts the update.
pub struct UpdateContext<'a> {
    instance: InstanceId,
    original: &'a ActivityNode,
    updated: &'a ActivityNode,
    values: BTreeMap<String, Value>,
    child_map: Vec<Option<usize>>,
    pub(crate) staged: Vec<(String, Value)>,
    pub(crate) disallowed: Option<String>,
}

impl<'a> UpdateContext<'a> {
    pub(crate) fn new(
        instance: InstanceId,
        original: &'a ActivityNode,
        updated: &'a ActivityNode,
        values: BTreeMap<String, Value>,
        child_map: Vec<Option<usize>>,
    ) -> Self {
        Self {
            instance,
            original,
            updated,
            values,
            child_map,
            staged: Vec::new(),
            disallowed: None,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    pub fn original_activity(&self) -> ActivityId {
        self.original.id
    }

    pub fn updated_activity(&self) -> ActivityId {
        self.updated.id
    }

    pub fn display_name(&self) -> &str {
        &self.updated.display_name
    }

    /// Current value of one of the instance's own symbols.
    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.staged
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .or_else(|| self.values.get(name))
    }

    /// Stage a write to a symbol of the new layout.
    pub fn set_value(&mut self, name: &str, value: Value) -> Result<(), WorkflowError> {
        let ordinal = self.updated.layout.find(name, true).ok_or_else(|| {
            WorkflowError::invalid_argument(format!("{} declares no symbol '{name}'", self.updated.display_name))
        })?;
        let symbol = self.updated.layout.symbol(ordinal);
        if symbol.is_some_and(|s| s.handle.is_some() || s.category == SymbolCategory::DelegateArgument) {
            return Err(WorkflowError::invalid_argument(format!(
                "'{name}' cannot be written during an update"
            )));
        }
        self.staged.push((name.to_string(), value));
        Ok(())
    }

    /// Position in the new definition of the child that was at `old_index`.
    pub fn new_child_index(&self, old_index: usize) -> Option<usize> {
        self.child_map.get(old_index).copied().flatten()
    }

    pub fn original_child_count(&self) -> usize {
        self.original.children.len()
    }

    pub fn disallow_update(&mut self, reason: impl Into<String>) {
        self.disallowed = Some(reason.into());
    }

    pub fn is_update_disallowed(&self) -> bool {
        self.disallowed.is_some()
    }
}
