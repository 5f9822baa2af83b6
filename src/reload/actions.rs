// src/reload/actions.rs

use super::graph::{Node, NodeKind};
use crate::script::value::{ClassObj, DictObj, ModuleObj, Value};
use std::{fmt, sync::Arc};

/// The live runtime object an action mutates.
#[derive(Debug, Clone)]
pub enum Container {
    Module(Arc<ModuleObj>),
    Class(Arc<ClassObj>),
    Dict(Arc<DictObj>),
}

impl Container {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Module(m) => Some(Self::Module(Arc::clone(m))),
            Value::Class(c) => Some(Self::Class(Arc::clone(c))),
            Value::Dict(d) => Some(Self::Dict(Arc::clone(d))),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Self::Module(m) => m.get(key),
            Self::Class(c) => c.get(key),
            Self::Dict(d) => d.get(key),
        }
    }

    pub fn set(&self, key: &str, value: Value) {
        match self {
            Self::Module(m) => m.set(key, value),
            Self::Class(c) => c.set(key.to_string(), value),
            Self::Dict(d) => d.insert(key.to_string(), value),
        }
    }

    pub fn remove(&self, key: &str) {
        match self {
            Self::Module(m) => {
                m.remove(key);
            }
            Self::Class(c) => {
                c.remove(key);
            }
            Self::Dict(d) => {
                d.remove(key);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    Add {
        parent: Container,
        node: Node,
    },
    Update {
        parent: Container,
        old: Node,
        new: Node,
    },
    Delete {
        parent: Container,
        node: Node,
    },
}

impl Action {
    /// The node the action is reported under.
    pub fn node(&self) -> &Node {
        match self {
            Self::Add { node, .. } | Self::Delete { node, .. } => node,
            Self::Update { old, .. } => old,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.node().kind
    }

    /// A `Module` update that re-enters the reloader on a dependent module.
    pub fn module_update(module: &Arc<ModuleObj>) -> Self {
        let node = Node {
            kind: NodeKind::Module,
            name: module.name.clone(),
            full_name: module.name.clone(),
            value: Value::Module(Arc::clone(module)),
            source: module.source.clone(),
            children: Default::default(),
        };
        Self::Update {
            parent: Container::Module(Arc::clone(module)),
            old: node.clone(),
            new: node,
        }
    }

    /// Applies the action to live objects. `Module` updates are handled by
    /// the reloader, which owns the import machinery.
    pub fn apply(&self, home: &Arc<ModuleObj>) {
        match self {
            Self::Add { parent, node } => {
                node.value.rehome(home);
                parent.set(&node.name, node.value.clone());
            }
            Self::Delete { parent, node } => parent.remove(&node.name),
            Self::Update { parent, old, new } => match (&old.value, &new.value) {
                (Value::Func(old_fn), Value::Func(new_fn)) => old_fn.set_code(new_fn.code()),
                _ if old.kind == NodeKind::Module => {}
                _ => {
                    new.value.rehome(home);
                    parent.set(&old.name, new.value.clone());
                }
            },
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Add { .. } => "Add",
            Self::Update { .. } => "Update",
            Self::Delete { .. } => "Delete",
        };
        let node = self.node();
        write!(f, "{} {} {}", verb, node.kind, node.full_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variable(name: &str, value: Value) -> Node {
        Node {
            kind: NodeKind::Variable,
            name: name.to_string(),
            full_name: format!("m.{}", name),
            value,
            source: String::new(),
            children: Default::default(),
        }
    }

    #[test]
    fn test_display_format() {
        let module = Arc::new(ModuleObj::new("car", None, ""));
        let update = Action::Update {
            parent: Container::Module(Arc::clone(&module)),
            old: variable("n", Value::Int(1)),
            new: variable("n", Value::Int(2)),
        };
        assert_eq!(update.to_string(), "Update Variable m.n");
        assert_eq!(Action::module_update(&module).to_string(), "Update Module car");
    }

    #[test]
    fn test_apply_add_update_delete() {
        let module = Arc::new(ModuleObj::new("m", None, ""));
        module.set("gone", Value::Int(0));
        let parent = Container::Module(Arc::clone(&module));

        Action::Add {
            parent: parent.clone(),
            node: variable("n", Value::Int(1)),
        }
        .apply(&module);
        assert!(module.get("n").unwrap().same_value(&Value::Int(1)));

        Action::Update {
            parent: parent.clone(),
            old: variable("n", Value::Int(1)),
            new: variable("n", Value::Int(2)),
        }
        .apply(&module);
        assert!(module.get("n").unwrap().same_value(&Value::Int(2)));

        Action::Delete { parent, node: variable("gone", Value::Int(0)) }.apply(&module);
        assert!(module.get("gone").is_none());
    }
}
