//! Two-phase dynamic update of a running instance.
//!
//! Phase one validates every live instance and environment against the new
//! definition and stages the changes; phase two applies them. The instance
//! must be quiescent throughout.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::ActivityExecutor;
use crate::activity::Activity;
use crate::definition::{ActivityTable, NodeRole};
use crate::errors::{BlockingActivity, InstanceUpdateError, WorkflowError};
use crate::ids::{ActivityId, EnvironmentId, InstanceId};
use crate::runtime::dynamic_update::{DynamicUpdateMap, UpdateContext};
use crate::runtime::environment::EnvironmentUpdateMap;
use crate::runtime::instance::Substate;
use crate::runtime::tracking::WorkflowInstanceEvent;
use crate::{Value, WorkflowIdentity};

pub(crate) struct PendingUpdate {
    definition: Arc<ActivityTable>,
    identity: WorkflowIdentity,
    instances: Vec<(InstanceId, ActivityId, Option<usize>)>,
    environments: Vec<(EnvironmentId, ActivityId, Option<EnvironmentUpdateMap>)>,
    writes: Vec<(InstanceId, String, Value)>,
}

impl ActivityExecutor {
    /// Instances that would prevent updating to `updated_root` with `map`.
    pub fn activities_blocking_update(
        &self,
        map: &DynamicUpdateMap,
        updated_root: Arc<dyn Activity>,
    ) -> Result<Vec<BlockingActivity>, WorkflowError> {
        let table = Arc::new(ActivityTable::build(updated_root)?);
        match self.prepare_update(map, table, self.identity.clone()) {
            Ok(_) => Ok(Vec::new()),
            Err(WorkflowError::InstanceUpdate(e)) if !e.blocking_activities.is_empty() => Ok(e.blocking_activities),
            Err(e) => Err(e),
        }
    }

    /// Validate and stage an update.
    pub fn update_instance_phase1(
        &mut self,
        map: &DynamicUpdateMap,
        updated_root: Arc<dyn Activity>,
        identity: WorkflowIdentity,
    ) -> Result<(), WorkflowError> {
        let table = Arc::new(ActivityTable::build(updated_root)?);
        let pending = self.prepare_update(map, table, identity)?;
        self.pending_update = Some(pending);
        Ok(())
    }

    /// Apply the update staged by [`Self::update_instance_phase1`].
    pub fn update_instance_phase2(&mut self) -> Result<(), WorkflowError> {
        let pending = self
            .pending_update
            .take()
            .ok_or_else(|| WorkflowError::invalid_operation("no update was prepared"))?;
        self.ensure_updatable()?;
        self.apply_update(pending);
        Ok(())
    }

    pub fn update_instance(
        &mut self,
        map: &DynamicUpdateMap,
        updated_root: Arc<dyn Activity>,
        identity: WorkflowIdentity,
    ) -> Result<(), WorkflowError> {
        self.update_instance_phase1(map, updated_root, identity)?;
        self.update_instance_phase2()
    }

    fn ensure_updatable(&self) -> Result<(), WorkflowError> {
        let reason = if self.scheduler.is_running() {
            "the scheduler is running"
        } else if self.in_flight.is_some() {
            "a host operation is outstanding"
        } else if !self.scheduler.is_idle() {
            "work items are pending"
        } else if self.isolation_scope().is_some() {
            "a runtime transaction is active"
        } else if !self.async_operations.is_empty() {
            "asynchronous operations are outstanding"
        } else if self.pending_termination.is_some() || self.is_aborted {
            "the instance is shutting down"
        } else if self.execution_state.is_some() {
            "the instance has completed"
        } else {
            return Ok(());
        };
        Err(InstanceUpdateError::new(format!("cannot update: {reason}")).into())
    }

    fn prepare_update(
        &self,
        map: &DynamicUpdateMap,
        table: Arc<ActivityTable>,
        identity: WorkflowIdentity,
    ) -> Result<PendingUpdate, WorkflowError> {
        self.ensure_updatable()?;
        let old = self.definition.clone();
        let mut blocking = Vec::new();
        let mut instances = Vec::new();
        let mut writes = Vec::new();

        for instance in self.instances.live() {
            let old_node = old.node(instance.activity)?;
            let block = |reason: String| BlockingActivity {
                instance: instance.id,
                activity: instance.activity,
                display_name: old_node.display_name.clone(),
                reason,
            };
            let entry = map.resolve(instance.activity, &old, &table);
            if let Some(reason) = entry.blocking_reason {
                blocking.push(block(reason));
                continue;
            }
            let Some(new_node) = entry.new_activity.and_then(|id| table.get(id)) else {
                blocking.push(block("activity was removed while executing".to_string()));
                continue;
            };
            if instance.substate == Substate::ResolvingArguments {
                blocking.push(block("arguments are still being resolved".to_string()));
                continue;
            }
            if let Some(parent) = instance.parent {
                let mapped_parent = self
                    .instances
                    .get(parent)
                    .and_then(|p| map.resolve(p.activity, &old, &table).new_activity);
                if mapped_parent != new_node.parent {
                    blocking.push(block("activity moved to a different parent".to_string()));
                    continue;
                }
            }
            let owns_new = new_node.layout.symbol_count() > 0;
            if owns_new != instance.owns_environment {
                blocking.push(block("environment would be added or removed".to_string()));
                continue;
            }

            let values: BTreeMap<String, Value> = instance
                .environment
                .filter(|_| instance.owns_environment)
                .and_then(|e| self.environments.get(e))
                .map(|env| {
                    env.locations()
                        .iter()
                        .filter(|l| l.handle_state().is_none())
                        .map(|l| (l.name.clone(), l.value.clone()))
                        .collect()
                })
                .unwrap_or_default();
            let child_map = old_node
                .children
                .iter()
                .map(|child| {
                    let mapped = map.resolve(*child, &old, &table).new_activity?;
                    new_node.children.iter().position(|c| *c == mapped)
                })
                .collect();
            let mut ctx = UpdateContext::new(instance.id, old_node, new_node, values, child_map);
            new_node.activity().update_instance(&mut ctx);
            if let Some(reason) = ctx.disallowed.take() {
                blocking.push(block(reason));
                continue;
            }
            writes.extend(ctx.staged.into_iter().map(|(name, value)| (instance.id, name, value)));

            let child_index = match new_node.role {
                NodeRole::Child(i) if instance.child_index.is_some() => Some(i),
                _ => instance.child_index,
            };
            instances.push((instance.id, new_node.id, child_index));
        }

        let mut environments = Vec::new();
        for env in self.environments.iter() {
            let old_node = old.node(env.definition)?;
            let block = |reason: String| BlockingActivity {
                instance: env.owner,
                activity: env.definition,
                display_name: old_node.display_name.clone(),
                reason,
            };
            let entry = map.resolve(env.definition, &old, &table);
            let Some(new_node) = entry.new_activity.and_then(|id| table.get(id)) else {
                // live owners were reported above
                if env.has_owner_completed() {
                    blocking.push(block(format!("environment {} is still referenced", env.id)));
                }
                continue;
            };
            let env_map = entry
                .environment
                .unwrap_or_else(|| EnvironmentUpdateMap::between(&old_node.layout, &new_node.layout));
            if let Err(e) = env.validate_update(&env_map, &old_node.layout, &new_node.layout) {
                blocking.push(block(e.message));
                continue;
            }
            let remap = (!env_map.is_identity()).then_some(env_map);
            environments.push((env.id, new_node.id, remap));
        }

        if !blocking.is_empty() {
            return Err(InstanceUpdateError::blocked(blocking).into());
        }
        Ok(PendingUpdate {
            definition: table,
            identity,
            instances,
            environments,
            writes,
        })
    }

    fn apply_update(&mut self, pending: PendingUpdate) {
        let PendingUpdate {
            definition,
            identity,
            instances,
            environments,
            writes,
        } = pending;

        for (id, activity, child_index) in instances {
            if let Some(instance) = self.instances.get_mut(id) {
                instance.activity = activity;
                instance.child_index = child_index;
            }
        }

        for (env_id, activity, remap) in environments {
            let Some(layout) = definition.get(activity).map(|n| &n.layout) else {
                continue;
            };
            let Some(env) = self.environments.get_mut(env_id) else {
                continue;
            };
            match remap {
                None => env.definition = activity,
                Some(map) => {
                    let outcome = env.update(&map, layout, activity);
                    self.mappable.retain(|location, _| location.environment != env_id);
                    self.register_mappables(env_id);
                    for handle in outcome.released_handles {
                        self.uninitialize_handle(handle);
                    }
                }
            }
        }

        let from = std::mem::replace(&mut self.identity, identity);
        self.definition = definition;

        for (id, name, value) in writes {
            let Some(env_id) = self
                .instances
                .get(id)
                .and_then(|i| i.environment.filter(|_| i.owns_environment))
            else {
                continue;
            };
            let definition = self.definition.clone();
            if let Some((env, ordinal)) = self.environments.resolve(Some(env_id), &name, true, &definition)
                && env == env_id
                && let Some(location) = self.environments.get_mut(env).and_then(|e| e.get_mut(ordinal))
            {
                location.value = value;
            }
        }

        self.track_workflow(WorkflowInstanceEvent::Updated);
        tracing::info!(
            target: "duroflow::runtime",
            instance_id = %self.instance_id,
            from = %from,
            to = %self.identity,
            "workflow instance updated"
        );
    }
}
