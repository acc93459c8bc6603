//! Ambient execution properties attached to activity instances.
//!
//! Properties registered on an instance are visible to it and every
//! descendant. Value properties are persisted with the instance. Workflow
//! thread properties wrap each work item that targets their subtree with
//! setup and cleanup calls; they hold live objects and are not persisted, so
//! hosts re-register them after loading.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Value;
use crate::errors::ErrorDetails;
use crate::ids::InstanceId;
use crate::runtime::instance::InstanceMap;

/// Hook run around every work item executed under the owning instance.
pub trait WorkflowThreadProperty: Send + Sync {
    fn setup_workflow_thread(&self) -> Result<(), ErrorDetails>;
    fn cleanup_workflow_thread(&self) -> Result<(), ErrorDetails>;
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ExecutionProperties {
    values: BTreeMap<String, Value>,
    #[serde(skip)]
    thread_properties: Vec<(String, Arc<dyn WorkflowThreadProperty>)>,
}

impl ExecutionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with_thread_property(mut self, name: impl Into<String>, property: Arc<dyn WorkflowThreadProperty>) -> Self {
        self.add_thread_property(name, property);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.thread_properties.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn add_thread_property(&mut self, name: impl Into<String>, property: Arc<dyn WorkflowThreadProperty>) {
        let name = name.into();
        self.thread_properties.retain(|(n, _)| *n != name);
        self.thread_properties.push((name, property));
    }

    pub(crate) fn merge(&mut self, other: ExecutionProperties) {
        self.values.extend(other.values);
        for (name, property) in other.thread_properties {
            self.add_thread_property(name, property);
        }
    }

    fn thread_property_list(&self) -> impl Iterator<Item = &Arc<dyn WorkflowThreadProperty>> {
        self.thread_properties.iter().map(|(_, p)| p)
    }
}

impl std::fmt::Debug for ExecutionProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionProperties")
            .field("values", &self.values)
            .field(
                "thread_properties",
                &self.thread_properties.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl PartialEq for ExecutionProperties {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
            && self
                .thread_properties
                .iter()
                .map(|(n, _)| n)
                .eq(other.thread_properties.iter().map(|(n, _)| n))
    }
}

/// Find a value property, nearest registration first.
pub(crate) fn find_property(instances: &InstanceMap, start: InstanceId, name: &str) -> Option<Value> {
    let mut cursor = Some(start);
    while let Some(id) = cursor {
        let instance = instances.get(id)?;
        if let Some(v) = instance.properties.get(name) {
            return Some(v.clone());
        }
        cursor = instance.parent;
    }
    None
}

/// Thread properties in scope for `start`, outermost first.
pub(crate) fn thread_properties_in_scope(
    instances: &InstanceMap,
    start: InstanceId,
) -> Vec<Arc<dyn WorkflowThreadProperty>> {
    let mut scopes = Vec::new();
    let mut cursor = Some(start);
    while let Some(id) = cursor {
        let Some(instance) = instances.get(id) else {
            break;
        };
        scopes.push(instance.properties.thread_property_list().cloned().collect::<Vec<_>>());
        cursor = instance.parent;
    }
    scopes.into_iter().rev().flatten().collect()
}
