//! Immutable, numbered view of an activity tree.

use std::sync::Arc;

use crate::Value;
use crate::activity::{
    Activity, ActivityMetadata, ArgumentBinding, ArgumentDirection, HandleKind, Variable, VariableKind,
};
use crate::errors::WorkflowError;
use crate::ids::ActivityId;

#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentSource {
    Literal(Value),
    Variable(String),
    Expression(ActivityId),
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentSymbol {
    pub name: String,
    pub direction: ArgumentDirection,
    pub source: ArgumentSource,
    pub default: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableSymbol {
    pub name: String,
    pub default: Value,
    pub mappable: bool,
    pub handle: Option<HandleKind>,
}

impl From<&Variable> for VariableSymbol {
    fn from(v: &Variable) -> Self {
        Self {
            name: v.name.clone(),
            default: v.default.clone(),
            mappable: v.mappable,
            handle: match v.kind {
                VariableKind::Value => None,
                VariableKind::Handle(kind) => Some(kind),
            },
        }
    }
}

/// Symbol categories, in environment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolCategory {
    Argument,
    DelegateArgument,
    PublicVariable,
    PrivateVariable,
}

/// One resolved symbol slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInfo<'a> {
    pub name: &'a str,
    pub category: SymbolCategory,
    pub default: &'a Value,
    pub mappable: bool,
    pub handle: Option<HandleKind>,
}

/// Environment layout: `[arguments][delegate arguments][public variables][private variables]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolLayout {
    pub arguments: Vec<ArgumentSymbol>,
    pub delegate_arguments: Vec<String>,
    pub public_variables: Vec<VariableSymbol>,
    pub private_variables: Vec<VariableSymbol>,
}

const NULL: Value = Value::Null;

impl SymbolLayout {
    pub fn symbol_count(&self) -> usize {
        self.arguments.len() + self.delegate_arguments.len() + self.public_variables.len() + self.private_variables.len()
    }

    fn delegate_offset(&self) -> usize {
        self.arguments.len()
    }

    fn public_offset(&self) -> usize {
        self.delegate_offset() + self.delegate_arguments.len()
    }

    fn private_offset(&self) -> usize {
        self.public_offset() + self.public_variables.len()
    }

    pub fn symbol(&self, ordinal: usize) -> Option<SymbolInfo<'_>> {
        if ordinal < self.delegate_offset() {
            let a = &self.arguments[ordinal];
            return Some(SymbolInfo {
                name: &a.name,
                category: SymbolCategory::Argument,
                default: &a.default,
                mappable: false,
                handle: None,
            });
        }
        if ordinal < self.public_offset() {
            return Some(SymbolInfo {
                name: &self.delegate_arguments[ordinal - self.delegate_offset()],
                category: SymbolCategory::DelegateArgument,
                default: &NULL,
                mappable: false,
                handle: None,
            });
        }
        let (vars, base, category) = if ordinal < self.private_offset() {
            (&self.public_variables, self.public_offset(), SymbolCategory::PublicVariable)
        } else {
            (&self.private_variables, self.private_offset(), SymbolCategory::PrivateVariable)
        };
        vars.get(ordinal - base).map(|v| SymbolInfo {
            name: &v.name,
            category,
            default: &v.default,
            mappable: v.mappable,
            handle: v.handle,
        })
    }

    /// Find a symbol by name. Descendants only see delegate arguments and
    /// public variables of their ancestors.
    pub fn find(&self, name: &str, owner_view: bool) -> Option<usize> {
        (0..self.symbol_count()).find(|&ordinal| {
            self.symbol(ordinal).is_some_and(|s| {
                s.name == name
                    && (owner_view
                        || matches!(s.category, SymbolCategory::DelegateArgument | SymbolCategory::PublicVariable))
            })
        })
    }

    pub fn argument_ordinal(&self, name: &str) -> Option<usize> {
        self.arguments.iter().position(|a| a.name == name)
    }

    pub fn delegate_argument_ordinal(&self, index: usize) -> Option<usize> {
        (index < self.delegate_arguments.len()).then(|| self.delegate_offset() + index)
    }
}

/// How a node is reached from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Root,
    Child(usize),
    ArgumentExpression(usize),
    DelegateHandler(usize),
}

pub struct ActivityNode {
    pub id: ActivityId,
    pub parent: Option<ActivityId>,
    pub role: NodeRole,
    pub display_name: String,
    pub children: Vec<ActivityId>,
    pub delegates: Vec<ActivityId>,
    pub layout: SymbolLayout,
    pub(crate) activity: Arc<dyn Activity>,
}

impl ActivityNode {
    pub fn activity(&self) -> &Arc<dyn Activity> {
        &self.activity
    }

    /// Path of role indices from the root, used to match nodes across
    /// definition versions.
    fn role_key(&self) -> String {
        match self.role {
            NodeRole::Root => "root".to_string(),
            NodeRole::Child(i) => format!("c{i}"),
            NodeRole::ArgumentExpression(i) => format!("x{i}"),
            NodeRole::DelegateHandler(i) => format!("d{i}"),
        }
    }
}

/// Arena of the definition tree in pre-order.
pub struct ActivityTable {
    nodes: Vec<ActivityNode>,
    hash: String,
}

impl ActivityTable {
    pub fn build(root: Arc<dyn Activity>) -> Result<Self, WorkflowError> {
        let mut table = Self {
            nodes: Vec::new(),
            hash: String::new(),
        };
        table.visit(root, None, NodeRole::Root)?;
        table.hash = table.compute_hash();
        Ok(table)
    }

    fn visit(
        &mut self,
        activity: Arc<dyn Activity>,
        parent: Option<ActivityId>,
        role: NodeRole,
    ) -> Result<ActivityId, WorkflowError> {
        let raw = u32::try_from(self.nodes.len() + 1)
            .map_err(|_| WorkflowError::invalid_argument("activity tree too large"))?;
        let id = ActivityId(raw);
        let mut metadata = ActivityMetadata::default();
        activity.cache_metadata(&mut metadata);
        if !metadata.errors.is_empty() {
            return Err(WorkflowError::invalid_argument(format!(
                "{} is invalid: {}",
                activity.display_name(),
                metadata.errors.join("; ")
            )));
        }

        self.nodes.push(ActivityNode {
            id,
            parent,
            role,
            display_name: activity.display_name().to_string(),
            children: Vec::new(),
            delegates: Vec::new(),
            layout: SymbolLayout::default(),
            activity: activity.clone(),
        });

        let ActivityMetadata {
            arguments,
            delegates,
            public_variables,
            private_variables,
            children,
            ..
        } = metadata;

        let mut layout = SymbolLayout::default();
        for (index, argument) in arguments.into_iter().enumerate() {
            if layout.arguments.iter().any(|a| a.name == argument.name) {
                return Err(WorkflowError::invalid_argument(format!(
                    "{} declares argument '{}' twice",
                    activity.display_name(),
                    argument.name
                )));
            }
            let source = match argument.binding {
                ArgumentBinding::Literal(v) => ArgumentSource::Literal(v),
                ArgumentBinding::Variable(name) => ArgumentSource::Variable(name),
                ArgumentBinding::Default => ArgumentSource::Default,
                ArgumentBinding::Expression(expr) => {
                    if argument.direction != ArgumentDirection::In {
                        return Err(WorkflowError::invalid_argument(format!(
                            "{}: output argument '{}' must be bound to a variable",
                            activity.display_name(),
                            argument.name
                        )));
                    }
                    ArgumentSource::Expression(self.visit(expr, Some(id), NodeRole::ArgumentExpression(index))?)
                }
            };
            layout.arguments.push(ArgumentSymbol {
                name: argument.name,
                direction: argument.direction,
                source,
                default: argument.default,
            });
        }
        layout.public_variables = public_variables.iter().map(VariableSymbol::from).collect();
        layout.private_variables = private_variables.iter().map(VariableSymbol::from).collect();

        let mut child_ids = Vec::with_capacity(children.len());
        for (index, child) in children.into_iter().enumerate() {
            child_ids.push(self.visit(child, Some(id), NodeRole::Child(index))?);
        }

        let mut delegate_ids = Vec::with_capacity(delegates.len());
        for (index, delegate) in delegates.into_iter().enumerate() {
            let handler = self.visit(delegate.handler, Some(id), NodeRole::DelegateHandler(index))?;
            self.node_mut(handler).layout.delegate_arguments = delegate.parameters;
            delegate_ids.push(handler);
        }

        let node = self.node_mut(id);
        node.layout = layout;
        node.children = child_ids;
        node.delegates = delegate_ids;
        Ok(id)
    }

    fn node_mut(&mut self, id: ActivityId) -> &mut ActivityNode {
        &mut self.nodes[(id.0 - 1) as usize]
    }

    pub fn get(&self, id: ActivityId) -> Option<&ActivityNode> {
        (id.0 as usize).checked_sub(1).and_then(|i| self.nodes.get(i))
    }

    pub(crate) fn node(&self, id: ActivityId) -> Result<&ActivityNode, WorkflowError> {
        self.get(id)
            .ok_or_else(|| WorkflowError::invalid_operation(format!("activity {id} is not part of the definition")))
    }

    pub fn root(&self) -> &ActivityNode {
        &self.nodes[0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActivityNode> {
        self.nodes.iter()
    }

    pub fn find_by_name(&self, display_name: &str) -> Option<ActivityId> {
        self.nodes.iter().find(|n| n.display_name == display_name).map(|n| n.id)
    }

    /// Slash-separated role path from the root, e.g. `root/c1/x0`.
    pub fn path(&self, id: ActivityId) -> Option<String> {
        let mut parts = Vec::new();
        let mut cursor = self.get(id);
        while let Some(node) = cursor {
            parts.push(node.role_key());
            cursor = node.parent.and_then(|p| self.get(p));
        }
        if parts.is_empty() {
            return None;
        }
        parts.reverse();
        Some(parts.join("/"))
    }

    pub fn find_by_path(&self, path: &str) -> Option<ActivityId> {
        self.nodes
            .iter()
            .map(|n| n.id)
            .find(|&id| self.path(id).as_deref() == Some(path))
    }

    /// Structural hash used to detect definition drift between a persisted
    /// instance and the definition it is reloaded with.
    pub fn definition_hash(&self) -> &str {
        &self.hash
    }

    fn compute_hash(&self) -> String {
        let mut h = Fnv1a::new();
        for node in &self.nodes {
            h.write(node.role_key().as_bytes());
            h.write(node.display_name.as_bytes());
            h.write(&(node.children.len() as u64).to_le_bytes());
            h.write(&(node.delegates.len() as u64).to_le_bytes());
            for a in &node.layout.arguments {
                h.write(a.name.as_bytes());
                h.write(format!("{:?}", a.direction).as_bytes());
            }
            for d in &node.layout.delegate_arguments {
                h.write(d.as_bytes());
            }
            for v in node.layout.public_variables.iter().chain(&node.layout.private_variables) {
                h.write(v.name.as_bytes());
                h.write(format!("{:?}", v.handle).as_bytes());
            }
            h.write(b";");
        }
        format!("{:016x}", h.finish())
    }
}

struct Fnv1a(u64);

impl Fnv1a {
    fn new() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= u64::from(*b);
            self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
        }
        // separator so ("ab","c") and ("a","bc") differ
        self.0 ^= 0xff;
        self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::{Assign, Literal, Sequence, WaitForBookmark};
    use crate::activity::Variable;
    use serde_json::json;

    fn sample() -> Arc<dyn Activity> {
        Arc::new(
            Sequence::new("Main")
                .with_variable(Variable::new("x", json!(0)))
                .then(Assign::expression("x", Arc::new(Literal::new(json!(5)))))
                .then(WaitForBookmark::new("Wait", "b1")),
        )
    }

    #[test]
    fn ids_are_preorder_with_expressions_before_children() {
        let table = ActivityTable::build(sample()).unwrap();
        assert_eq!(table.root().id, ActivityId::ROOT);
        assert_eq!(table.root().display_name, "Main");
        let assign = table.node(ActivityId(2)).unwrap();
        assert_eq!(assign.display_name, "Assign");
        assert_eq!(assign.parent, Some(ActivityId::ROOT));
        let literal = table.node(ActivityId(3)).unwrap();
        assert_eq!(literal.role, NodeRole::ArgumentExpression(0));
        assert_eq!(literal.parent, Some(ActivityId(2)));
        assert_eq!(table.node(ActivityId(4)).unwrap().display_name, "Wait");
        assert_eq!(table.path(ActivityId(3)).as_deref(), Some("root/c0/x0"));
        assert_eq!(table.find_by_path("root/c1"), Some(ActivityId(4)));
    }

    #[test]
    fn layout_orders_symbol_categories() {
        let table = ActivityTable::build(sample()).unwrap();
        let layout = &table.root().layout;
        let public = layout.find("x", false).unwrap();
        assert_eq!(layout.symbol(public).unwrap().category, SymbolCategory::PublicVariable);
        let index = layout.find("index", true).unwrap();
        assert_eq!(layout.symbol(index).unwrap().category, SymbolCategory::PrivateVariable);
        assert!(layout.find("index", false).is_none(), "private variables are hidden from descendants");
        assert!(index > public);
    }

    #[test]
    fn hash_tracks_structure() {
        let a = ActivityTable::build(sample()).unwrap();
        let b = ActivityTable::build(sample()).unwrap();
        assert_eq!(a.definition_hash(), b.definition_hash());

        let changed: Arc<dyn Activity> = Arc::new(
            Sequence::new("Main")
                .with_variable(Variable::new("x", json!(0)))
                .then(WaitForBookmark::new("Wait", "b1")),
        );
        let c = ActivityTable::build(changed).unwrap();
        assert_ne!(a.definition_hash(), c.definition_hash());
    }
}
