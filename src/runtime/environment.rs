//! Hierarchical argument and variable storage.
//!
//! Every instance that declares symbols owns one [`LocationEnvironment`];
//! instances without symbols share their parent's. Environments are normally
//! disposed when their owner completes, but secondary roots can keep an
//! environment chain alive past that point through reference counts. Such an
//! environment is "dangling": its owner is gone and only the count keeps it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::definition::{ActivityTable, SymbolLayout};
use crate::errors::{InstanceUpdateError, WorkflowError};
use crate::ids::{ActivityId, EnvironmentId, InstanceId};
use crate::runtime::location::{HandleState, Location, LocationKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum LocationStorage {
    Empty,
    Single(Location),
    Many(Vec<Location>),
}

impl LocationStorage {
    fn from_vec(mut locations: Vec<Location>) -> Self {
        match locations.len() {
            0 => LocationStorage::Empty,
            1 => LocationStorage::Single(locations.remove(0)),
            _ => LocationStorage::Many(locations),
        }
    }

    fn as_slice(&self) -> &[Location] {
        match self {
            LocationStorage::Empty => &[],
            LocationStorage::Single(l) => std::slice::from_ref(l),
            LocationStorage::Many(v) => v,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [Location] {
        match self {
            LocationStorage::Empty => &mut [],
            LocationStorage::Single(l) => std::slice::from_mut(l),
            LocationStorage::Many(v) => v,
        }
    }

    /// Turn the single-location form into a one-element vector.
    fn normalize(&mut self) -> &mut Vec<Location> {
        let taken = std::mem::replace(self, LocationStorage::Empty);
        *self = LocationStorage::Many(match taken {
            LocationStorage::Empty => Vec::new(),
            LocationStorage::Single(l) => vec![l],
            LocationStorage::Many(v) => v,
        });
        match self {
            LocationStorage::Many(v) => v,
            _ => unreachable!("normalized storage is always Many"),
        }
    }
}

/// Resources released by disposing an environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisposedEnvironment {
    pub environment: EnvironmentId,
    /// Handles that must be uninitialized
    pub handles: Vec<HandleState>,
    /// Mappable locations to unregister from host inspection
    pub mappables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationEnvironment {
    pub id: EnvironmentId,
    pub parent: Option<EnvironmentId>,
    /// Activity whose layout this environment follows
    pub definition: ActivityId,
    pub owner: InstanceId,
    storage: LocationStorage,
    reference_count: u32,
    has_owner_completed: bool,
    is_disposed: bool,
    has_handles: bool,
    has_mappable_locations: bool,
}

fn fresh_locations(layout: &SymbolLayout, owner: InstanceId) -> Vec<Location> {
    (0..layout.symbol_count())
        .filter_map(|ordinal| layout.symbol(ordinal))
        .map(|symbol| {
            let mut location = match symbol.handle {
                Some(kind) => Location::handle(symbol.name, HandleState::initialize(kind, owner)),
                None => Location::new(symbol.name, symbol.default.clone()),
            };
            location.mappable = symbol.mappable;
            location
        })
        .collect()
}

impl LocationEnvironment {
    pub fn new(
        id: EnvironmentId,
        parent: Option<EnvironmentId>,
        definition: ActivityId,
        owner: InstanceId,
        layout: &SymbolLayout,
    ) -> Self {
        let locations = fresh_locations(layout, owner);
        let has_handles = locations.iter().any(|l| l.handle_state().is_some());
        let has_mappable_locations = locations.iter().any(|l| l.mappable);
        Self {
            id,
            parent,
            definition,
            owner,
            storage: LocationStorage::from_vec(locations),
            reference_count: 0,
            has_owner_completed: false,
            is_disposed: false,
            has_handles,
            has_mappable_locations,
        }
    }

    pub fn len(&self) -> usize {
        self.storage.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn locations(&self) -> &[Location] {
        self.storage.as_slice()
    }

    pub fn get(&self, ordinal: usize) -> Option<&Location> {
        self.storage.as_slice().get(ordinal)
    }

    pub fn get_mut(&mut self, ordinal: usize) -> Option<&mut Location> {
        self.storage.as_mut_slice().get_mut(ordinal)
    }

    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }

    pub fn has_owner_completed(&self) -> bool {
        self.has_owner_completed
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed
    }

    pub fn has_handles(&self) -> bool {
        self.has_handles
    }

    pub fn has_mappable_locations(&self) -> bool {
        self.has_mappable_locations
    }

    pub fn add_reference(&mut self) {
        self.reference_count += 1;
    }

    /// Drop a reference, or record that the owner completed. Returns whether
    /// the environment should now be disposed.
    pub fn remove_reference(&mut self, is_owner: bool) -> bool {
        if is_owner {
            self.has_owner_completed = true;
        } else if self.reference_count == 0 {
            tracing::warn!(environment = %self.id, "reference released on environment with no references");
        } else {
            self.reference_count -= 1;
        }
        self.should_dispose()
    }

    pub fn should_dispose(&self) -> bool {
        !self.is_disposed && self.has_owner_completed && self.reference_count == 0
    }

    /// Tear down the environment. Only the first call yields resources.
    pub fn dispose(&mut self) -> Option<DisposedEnvironment> {
        if self.is_disposed {
            return None;
        }
        self.is_disposed = true;
        let mut disposed = DisposedEnvironment {
            environment: self.id,
            ..Default::default()
        };
        for location in self.storage.as_slice() {
            if let Some(state) = location.handle_state() {
                disposed.handles.push(state.clone());
            }
            if location.mappable {
                disposed.mappables.push(location.name.clone());
            }
        }
        Some(disposed)
    }

    pub fn has_temporary_locations(&self) -> bool {
        self.storage.as_slice().iter().any(Location::is_temporary)
    }

    pub(crate) fn collapse_temporaries(&mut self) {
        for location in self.storage.as_mut_slice() {
            location.collapse();
        }
    }

    /// Check an update map against both the old and the new layout.
    pub fn validate_update(
        &self,
        map: &EnvironmentUpdateMap,
        old: &SymbolLayout,
        new: &SymbolLayout,
    ) -> Result<(), InstanceUpdateError> {
        let expect = |what: &str, declared: usize, actual: usize| {
            if declared == actual {
                Ok(())
            } else {
                Err(InstanceUpdateError::new(format!(
                    "environment {}: update map declares {declared} {what} but the activity has {actual}",
                    self.id
                )))
            }
        };
        expect("old arguments", map.old_argument_count, old.arguments.len())?;
        expect("new arguments", map.new_argument_count, new.arguments.len())?;
        expect(
            "old delegate arguments",
            map.old_delegate_argument_count,
            old.delegate_arguments.len(),
        )?;
        expect(
            "new delegate arguments",
            map.new_delegate_argument_count,
            new.delegate_arguments.len(),
        )?;
        expect("old variables", map.old_variable_count, old.public_variables.len())?;
        expect("new variables", map.new_variable_count, new.public_variables.len())?;
        expect(
            "old private variables",
            map.old_private_variable_count,
            old.private_variables.len(),
        )?;
        expect(
            "new private variables",
            map.new_private_variable_count,
            new.private_variables.len(),
        )?;
        if self.len() != old.symbol_count() {
            return Err(InstanceUpdateError::new(format!(
                "environment {} holds {} locations but the old activity declares {}",
                self.id,
                self.len(),
                old.symbol_count()
            )));
        }
        if self.has_temporary_locations() {
            return Err(InstanceUpdateError::new(format!(
                "environment {} is resolving arguments",
                self.id
            )));
        }

        let new_total = map.new_symbol_count();
        let old_total = map.old_symbol_count();
        let mut seen = vec![false; new_total];
        for entry in &map.entries {
            if entry.new_offset >= new_total {
                return Err(InstanceUpdateError::new(format!(
                    "update map entry targets offset {} beyond {} symbols",
                    entry.new_offset, new_total
                )));
            }
            if entry.old_offset.is_some_and(|o| o >= old_total) {
                return Err(InstanceUpdateError::new(format!(
                    "update map entry reads offset {:?} beyond {} symbols",
                    entry.old_offset, old_total
                )));
            }
            if std::mem::replace(&mut seen[entry.new_offset], true) {
                return Err(InstanceUpdateError::new(format!(
                    "update map targets offset {} twice",
                    entry.new_offset
                )));
            }
        }
        Ok(())
    }

    /// Rebuild the location array for a new layout.
    ///
    /// Callers validate with [`LocationEnvironment::validate_update`] first.
    pub fn update(
        &mut self,
        map: &EnvironmentUpdateMap,
        new_layout: &SymbolLayout,
        new_definition: ActivityId,
    ) -> EnvironmentUpdateOutcome {
        let mut outcome = EnvironmentUpdateOutcome::default();
        let old = std::mem::take(self.storage.normalize());
        let mut fresh = fresh_locations(new_layout, self.owner);
        let mut survived = vec![false; old.len()];

        for entry in &map.entries {
            let Some(old_offset) = entry.old_offset else {
                continue;
            };
            let (Some(source), Some(target)) = (old.get(old_offset), fresh.get_mut(entry.new_offset)) else {
                continue;
            };
            survived[old_offset] = true;
            let mappable = target.mappable;
            let name = std::mem::take(&mut target.name);
            *target = source.clone();
            target.name = name;
            if source.mappable && !mappable {
                outcome.unregistered.push(source.name.clone());
            }
            if mappable && !source.mappable {
                outcome.registered.push(target.name.clone());
            }
            target.mappable = mappable;
        }

        for (offset, location) in old.into_iter().enumerate() {
            if survived[offset] {
                continue;
            }
            if location.mappable {
                outcome.unregistered.push(location.name.clone());
            }
            if let LocationKind::Handle(state) = location.kind {
                outcome.released_handles.push(state);
            }
        }
        let targeted: Vec<usize> = map.entries.iter().filter(|e| e.old_offset.is_some()).map(|e| e.new_offset).collect();
        for (offset, location) in fresh.iter().enumerate() {
            if location.mappable && !targeted.contains(&offset) {
                outcome.registered.push(location.name.clone());
            }
        }

        self.has_handles = fresh.iter().any(|l| l.handle_state().is_some());
        self.has_mappable_locations = fresh.iter().any(|l| l.mappable);
        self.storage = LocationStorage::from_vec(fresh);
        self.definition = new_definition;
        outcome
    }
}

/// Side effects of [`LocationEnvironment::update`] the executor must apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentUpdateOutcome {
    pub registered: Vec<String>,
    pub unregistered: Vec<String>,
    pub released_handles: Vec<HandleState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentUpdateMapEntry {
    /// `None` for a newly added symbol
    pub old_offset: Option<usize>,
    pub new_offset: usize,
}

/// Per-category symbol remapping for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvironmentUpdateMap {
    pub old_argument_count: usize,
    pub new_argument_count: usize,
    pub old_delegate_argument_count: usize,
    pub new_delegate_argument_count: usize,
    pub old_variable_count: usize,
    pub new_variable_count: usize,
    pub old_private_variable_count: usize,
    pub new_private_variable_count: usize,
    pub entries: Vec<EnvironmentUpdateMapEntry>,
}

impl EnvironmentUpdateMap {
    pub fn old_symbol_count(&self) -> usize {
        self.old_argument_count
            + self.old_delegate_argument_count
            + self.old_variable_count
            + self.old_private_variable_count
    }

    pub fn new_symbol_count(&self) -> usize {
        self.new_argument_count
            + self.new_delegate_argument_count
            + self.new_variable_count
            + self.new_private_variable_count
    }

    /// Match symbols by category and name.
    pub fn between(old: &SymbolLayout, new: &SymbolLayout) -> Self {
        let mut entries = Vec::new();
        for new_offset in 0..new.symbol_count() {
            let Some(symbol) = new.symbol(new_offset) else {
                continue;
            };
            let old_offset = (0..old.symbol_count()).find(|&o| {
                old.symbol(o)
                    .is_some_and(|s| s.name == symbol.name && s.category == symbol.category && s.handle == symbol.handle)
            });
            entries.push(EnvironmentUpdateMapEntry { old_offset, new_offset });
        }
        Self {
            old_argument_count: old.arguments.len(),
            new_argument_count: new.arguments.len(),
            old_delegate_argument_count: old.delegate_arguments.len(),
            new_delegate_argument_count: new.delegate_arguments.len(),
            old_variable_count: old.public_variables.len(),
            new_variable_count: new.public_variables.len(),
            old_private_variable_count: old.private_variables.len(),
            new_private_variable_count: new.private_variables.len(),
            entries,
        }
    }

    /// Whether applying the map leaves every location where it was.
    pub fn is_identity(&self) -> bool {
        self.old_symbol_count() == self.new_symbol_count()
            && self.old_argument_count == self.new_argument_count
            && self.old_variable_count == self.new_variable_count
            && self.old_private_variable_count == self.new_private_variable_count
            && self.entries.len() == self.new_symbol_count()
            && self.entries.iter().all(|e| e.old_offset == Some(e.new_offset))
    }
}

/// All environments of one workflow instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentArena {
    environments: BTreeMap<EnvironmentId, LocationEnvironment>,
    next_id: u64,
}

impl EnvironmentArena {
    pub fn create(
        &mut self,
        parent: Option<EnvironmentId>,
        definition: ActivityId,
        owner: InstanceId,
        layout: &SymbolLayout,
    ) -> Result<EnvironmentId, WorkflowError> {
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| WorkflowError::invalid_operation("out of environment ids"))?;
        let id = EnvironmentId(self.next_id);
        self.environments
            .insert(id, LocationEnvironment::new(id, parent, definition, owner, layout));
        Ok(id)
    }

    pub fn get(&self, id: EnvironmentId) -> Option<&LocationEnvironment> {
        self.environments.get(&id)
    }

    pub fn get_mut(&mut self, id: EnvironmentId) -> Option<&mut LocationEnvironment> {
        self.environments.get_mut(&id)
    }

    pub fn contains(&self, id: EnvironmentId) -> bool {
        self.environments.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocationEnvironment> {
        self.environments.values()
    }

    /// Environments whose owner completed and that survive only through
    /// references.
    pub fn dangling(&self) -> impl Iterator<Item = &LocationEnvironment> {
        self.environments.values().filter(|e| e.has_owner_completed())
    }

    fn chain(&self, id: EnvironmentId) -> Vec<EnvironmentId> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(env) = self.environments.get(&current) else {
                break;
            };
            chain.push(current);
            cursor = env.parent;
        }
        chain
    }

    /// Reference an environment and every ancestor it can read through.
    pub fn add_reference(&mut self, id: EnvironmentId) {
        for env_id in self.chain(id) {
            if let Some(env) = self.environments.get_mut(&env_id) {
                env.add_reference();
            }
        }
    }

    /// Release an owner or a reference. Returns the environments disposed as a
    /// result, innermost first.
    pub fn remove_reference(&mut self, id: EnvironmentId, is_owner: bool) -> Vec<DisposedEnvironment> {
        let targets = if is_owner { vec![id] } else { self.chain(id) };
        let mut disposed = Vec::new();
        for env_id in targets {
            let Some(env) = self.environments.get_mut(&env_id) else {
                continue;
            };
            if env.remove_reference(is_owner)
                && let Some(resources) = env.dispose()
            {
                self.environments.remove(&env_id);
                disposed.push(resources);
            }
        }
        disposed
    }

    /// Read a symbol, searching `start` and then its ancestors.
    pub(crate) fn resolve(
        &self,
        start: Option<EnvironmentId>,
        name: &str,
        owner_view: bool,
        table: &ActivityTable,
    ) -> Option<(EnvironmentId, usize)> {
        let mut cursor = start;
        let mut first = owner_view;
        while let Some(id) = cursor {
            let env = self.environments.get(&id)?;
            if let Some(node) = table.get(env.definition)
                && let Some(ordinal) = node.layout.find(name, first)
            {
                return Some((id, ordinal));
            }
            first = false;
            cursor = env.parent;
        }
        None
    }

    /// Ensure every parent link points at a live environment.
    pub(crate) fn validate_links(&self) -> Result<(), WorkflowError> {
        for env in self.environments.values() {
            if let Some(parent) = env.parent
                && !self.environments.contains_key(&parent)
            {
                return Err(WorkflowError::invalid_operation(format!(
                    "environment {} references missing parent {parent}",
                    env.id
                )));
            }
            if env.is_disposed() {
                return Err(WorkflowError::invalid_operation(format!(
                    "environment {} was disposed but is still stored",
                    env.id
                )));
            }
            if env.has_owner_completed() && env.reference_count() == 0 {
                return Err(WorkflowError::invalid_operation(format!(
                    "environment {} outlived its owner without references",
                    env.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;
    use crate::activity::{ArgumentDirection, HandleKind};
    use crate::definition::{ArgumentSource, ArgumentSymbol, VariableSymbol};
    use serde_json::json;

    fn var(name: &str, default: Value) -> VariableSymbol {
        VariableSymbol {
            name: name.into(),
            default,
            mappable: false,
            handle: None,
        }
    }

    fn layout() -> SymbolLayout {
        SymbolLayout {
            arguments: vec![ArgumentSymbol {
                name: "In".into(),
                direction: ArgumentDirection::In,
                source: ArgumentSource::Default,
                default: json!(1),
            }],
            delegate_arguments: vec![],
            public_variables: vec![var("x", json!(10)), var("y", json!(20))],
            private_variables: vec![VariableSymbol {
                name: "np".into(),
                default: Value::Null,
                mappable: false,
                handle: Some(HandleKind::NoPersist),
            }],
        }
    }

    #[test]
    fn owner_completion_disposes_unreferenced_environment() {
        let mut arena = EnvironmentArena::default();
        let id = arena.create(None, ActivityId(1), InstanceId(1), &layout()).unwrap();
        let disposed = arena.remove_reference(id, true);
        assert_eq!(disposed.len(), 1);
        assert_eq!(disposed[0].handles.len(), 1);
        assert!(!arena.contains(id));
    }

    #[test]
    fn references_keep_chain_alive_after_owner_completes() {
        let mut arena = EnvironmentArena::default();
        let parent = arena.create(None, ActivityId(1), InstanceId(1), &layout()).unwrap();
        let child = arena.create(Some(parent), ActivityId(2), InstanceId(2), &layout()).unwrap();
        arena.add_reference(child);
        assert_eq!(arena.get(parent).unwrap().reference_count(), 1);

        assert!(arena.remove_reference(child, true).is_empty());
        assert!(arena.remove_reference(parent, true).is_empty());
        assert_eq!(arena.dangling().count(), 2);

        let disposed = arena.remove_reference(child, false);
        let ids: Vec<_> = disposed.iter().map(|d| d.environment).collect();
        assert_eq!(ids, vec![child, parent]);
        assert!(arena.is_empty());
    }

    #[test]
    fn update_normalizes_single_location_and_maps_by_name() {
        let old = SymbolLayout {
            public_variables: vec![var("x", json!(0))],
            ..Default::default()
        };
        let new = SymbolLayout {
            public_variables: vec![var("w", json!("fresh")), var("x", json!(0))],
            ..Default::default()
        };
        let mut env = LocationEnvironment::new(EnvironmentId(1), None, ActivityId(1), InstanceId(1), &old);
        env.get_mut(0).unwrap().value = json!(42);

        let map = EnvironmentUpdateMap::between(&old, &new);
        env.validate_update(&map, &old, &new).unwrap();
        env.update(&map, &new, ActivityId(1));

        assert_eq!(env.len(), 2);
        assert_eq!(env.get(0).unwrap().value, json!("fresh"));
        assert_eq!(env.get(1).unwrap().value, json!(42));
    }

    #[test]
    fn update_rejects_count_mismatch() {
        let old = layout();
        let new = layout();
        let env = LocationEnvironment::new(EnvironmentId(1), None, ActivityId(1), InstanceId(1), &old);
        let mut map = EnvironmentUpdateMap::between(&old, &new);
        map.old_variable_count = 3;
        let err = env.validate_update(&map, &old, &new).unwrap_err();
        assert!(err.message.contains("old variables"));
    }

    #[test]
    fn update_reports_removed_handles_and_mappables() {
        let mut old = layout();
        old.public_variables[0].mappable = true;
        let new = SymbolLayout {
            arguments: old.arguments.clone(),
            public_variables: vec![var("y", json!(20))],
            ..Default::default()
        };
        let mut env = LocationEnvironment::new(EnvironmentId(1), None, ActivityId(1), InstanceId(7), &old);
        let map = EnvironmentUpdateMap::between(&old, &new);
        env.validate_update(&map, &old, &new).unwrap();
        let outcome = env.update(&map, &new, ActivityId(1));
        assert_eq!(outcome.unregistered, vec!["x".to_string()]);
        assert_eq!(outcome.released_handles.len(), 1);
        assert!(!env.has_handles());
    }

    proptest::proptest! {
        #[test]
        fn disposal_happens_once_after_owner_and_references_are_gone(
            ops in proptest::collection::vec(proptest::bool::ANY, 0..24),
            owner_at in 0usize..24,
        ) {
            let mut arena = EnvironmentArena::default();
            let id = arena.create(None, ActivityId(1), InstanceId(1), &layout()).unwrap();
            let mut live = 0u32;
            let mut owner_done = false;
            let mut disposals = 0;
            let owner_at = owner_at.min(ops.len());

            for (step, add) in ops.iter().enumerate() {
                if step == owner_at {
                    owner_done = true;
                    disposals += arena.remove_reference(id, true).len();
                }
                if disposals > 0 {
                    break;
                }
                if *add {
                    arena.add_reference(id);
                    live += 1;
                } else if live > 0 {
                    live -= 1;
                    disposals += arena.remove_reference(id, false).len();
                }
                if disposals == 0 {
                    proptest::prop_assert_eq!(arena.get(id).unwrap().reference_count(), live);
                }
            }
            if !owner_done {
                disposals += arena.remove_reference(id, true).len();
            }
            while disposals == 0 && live > 0 {
                live -= 1;
                disposals += arena.remove_reference(id, false).len();
            }

            proptest::prop_assert_eq!(disposals, 1);
            proptest::prop_assert_eq!(live, 0);
            proptest::prop_assert!(!arena.contains(id));
        }
    }
}
