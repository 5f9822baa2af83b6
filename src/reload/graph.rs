// src/reload/graph.rs

use crate::script::value::{ModuleObj, Value};
use std::{collections::BTreeMap, fmt, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Module,
    Class,
    Dictionary,
    Function,
    Method,
    Variable,
    DictionaryItem,
    Import,
}

impl NodeKind {
    /// Data nodes whose changes must be propagated to dependent modules.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Variable | Self::DictionaryItem | Self::Dictionary)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Module => "Module",
            Self::Class => "Class",
            Self::Dictionary => "Dictionary",
            Self::Function => "Function",
            Self::Method => "Method",
            Self::Variable => "Variable",
            Self::DictionaryItem => "DictionaryItem",
            Self::Import => "Import",
        };
        write!(f, "{}", name)
    }
}

/// One node of a module's object tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    /// Key under the parent container.
    pub name: String,
    /// Dotted path from the module, e.g. `carwash.Car.wheels`.
    pub full_name: String,
    pub value: Value,
    pub source: String,
    pub children: BTreeMap<String, Node>,
}

impl Node {
    fn leaf(kind: NodeKind, name: &str, full_name: String, value: Value, source: String) -> Self {
        Self {
            kind,
            name: name.to_string(),
            full_name,
            value,
            source,
            children: BTreeMap::new(),
        }
    }
}

/// Builds the object tree of `module`. Builtins, objects defined in other
/// modules and objects already present on the ancestor chain are skipped.
pub fn build_module_tree(module: &Arc<ModuleObj>) -> Node {
    let mut root = Node::leaf(
        NodeKind::Module,
        &module.name,
        module.name.clone(),
        Value::Module(Arc::clone(module)),
        module.source.clone(),
    );
    let mut ancestors = vec![Arc::as_ptr(module) as usize];
    for (key, value) in module.snapshot() {
        let child = build_child(
            &module.name,
            &root.full_name,
            NodeKind::Module,
            &key,
            value,
            &mut ancestors,
        );
        if let Some(child) = child {
            root.children.insert(key, child);
        }
    }
    root
}

fn classify(module_name: &str, parent: NodeKind, value: &Value) -> Option<NodeKind> {
    let kind = match value {
        Value::Builtin(_) => return None,
        Value::Module(_) => NodeKind::Import,
        Value::Func(func) => {
            if func.module_name() != module_name {
                return None;
            }
            if parent == NodeKind::Class {
                NodeKind::Method
            } else {
                NodeKind::Function
            }
        }
        Value::Class(class) => {
            if class.module_name() != module_name {
                return None;
            }
            NodeKind::Class
        }
        Value::Dict(_) => NodeKind::Dictionary,
        _ if parent == NodeKind::Dictionary => NodeKind::DictionaryItem,
        _ => NodeKind::Variable,
    };
    Some(kind)
}

fn build_child(
    module_name: &str,
    parent_name: &str,
    parent_kind: NodeKind,
    key: &str,
    value: Value,
    ancestors: &mut Vec<usize>,
) -> Option<Node> {
    let kind = classify(module_name, parent_kind, &value)?;
    if let Some(id) = value.identity() {
        if ancestors.contains(&id) {
            return None;
        }
    }

    let full_name = format!("{}.{}", parent_name, key);
    let source = match &value {
        Value::Func(func) => func.code().source.clone(),
        Value::Class(class) => class.source.clone(),
        other => other.repr(),
    };
    let mut node = Node::leaf(kind, key, full_name, value.clone(), source);

    let members = match &value {
        Value::Class(class) => class.snapshot(),
        Value::Dict(dict) => dict.snapshot(),
        _ => return Some(node),
    };
    if let Some(id) = value.identity() {
        ancestors.push(id);
    }
    for (member_key, member) in members {
        if let Some(child) = build_child(module_name, &node.full_name, kind, &member_key, member, ancestors) {
            node.children.insert(member_key, child);
        }
    }
    ancestors.pop();
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{interp::{self, Importer}, parser, ScriptError};

    struct Single(Arc<ModuleObj>);

    impl Importer for Single {
        fn import(&self, _name: &str, _parent: Option<&str>) -> Result<Arc<ModuleObj>, ScriptError> {
            Ok(Arc::clone(&self.0))
        }
    }

    fn module(name: &str, source: &str, other: Arc<ModuleObj>) -> Arc<ModuleObj> {
        let module = Arc::new(ModuleObj::new(name, None, source));
        let program = parser::parse_program(source, name).unwrap();
        interp::exec_module(&program, &module, &Single(other), None).unwrap();
        module
    }

    #[test]
    fn test_tree_classifies_members() {
        let tools = module("tools", "fn helper() = 1\n", Arc::new(ModuleObj::new("x", None, "")));
        let m = module(
            "m",
            concat!(
                "import tools\nfrom tools import helper\nn = 1\nfn f(a) = a\n",
                "colors = {\"red\": 1}\nclass C {\n  fn g() = 2\n}\n",
            ),
            tools,
        );
        let tree = build_module_tree(&m);

        assert_eq!(tree.children["tools"].kind, NodeKind::Import);
        assert!(!tree.children.contains_key("helper"), "foreign functions are skipped");
        assert_eq!(tree.children["n"].kind, NodeKind::Variable);
        assert_eq!(tree.children["f"].kind, NodeKind::Function);
        assert_eq!(tree.children["colors"].kind, NodeKind::Dictionary);
        assert_eq!(tree.children["colors"].children["red"].kind, NodeKind::DictionaryItem);
        assert_eq!(tree.children["colors"].children["red"].full_name, "m.colors.red");
        assert_eq!(tree.children["C"].children["g"].kind, NodeKind::Method);
    }

    #[test]
    fn test_self_referencing_dict_is_cut() {
        let m = Arc::new(ModuleObj::new("m", None, ""));
        let dict = Arc::new(crate::script::value::DictObj::default());
        dict.insert("me".to_string(), Value::Dict(Arc::clone(&dict)));
        m.set("d", Value::Dict(Arc::clone(&dict)));

        let tree = build_module_tree(&m);
        assert!(tree.children["d"].children.is_empty());
        // Break the cycle so the test does not leak.
        dict.remove("me");
    }
}
