// src/reload/reloader.rs

use super::{
    ReloadError,
    actions::{Action, Container},
    graph::{Node, NodeKind, build_module_tree},
};
use crate::{
    dev_utils::BlockTimer,
    script::{ModuleRegistry, value::{ModuleObj, Value}},
};
use serde::Serialize;
use std::{collections::HashSet, sync::Arc};

/// Outcome of a successful partial reload, as printed to the shell.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadReport {
    pub module: String,
    pub actions: Vec<String>,
}

impl ReloadReport {
    pub fn summary(&self) -> String {
        format!("Reloaded {}: {} actions", self.module, self.actions.len())
    }
}

/// Diffs live script modules against fresh imports and patches them in place.
#[derive(Debug, Clone)]
pub struct PartialReloader {
    registry: Arc<ModuleRegistry>,
}

impl PartialReloader {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Computes the action list for `name` without mutating anything.
    ///
    /// When the module's data changes, one `Module` update per transitive
    /// dependent is appended, in import order.
    pub fn get_actions(&self, name: &str) -> Result<Vec<Action>, ReloadError> {
        let live = self
            .registry
            .get(name)
            .ok_or_else(|| ReloadError::NotLoaded(name.to_string()))?;
        let fresh = self.load_fresh(name)?;

        let mut actions = diff_modules(&live, &fresh);
        if actions.iter().any(|a| a.kind().is_data()) {
            let mut visited: HashSet<String> = HashSet::from([name.to_string()]);
            for dependent in self.registry.tracker().reload_targets(name) {
                if !visited.insert(dependent.clone()) {
                    continue;
                }
                if let Some(module) = self.registry.get(&dependent) {
                    actions.push(Action::module_update(&module));
                }
            }
        }
        Ok(actions)
    }

    /// Reloads `name` in place. A failed re-import leaves every live object
    /// untouched; a failure inside a dependent module is reported as
    /// [`ReloadError::Partial`] after the preceding actions were applied.
    pub fn run(&self, name: &str) -> Result<ReloadReport, ReloadError> {
        let _timer = BlockTimer::new(format!("partial reload {}", name));
        let actions = self.get_actions(name)?;
        let live = self
            .registry
            .get(name)
            .ok_or_else(|| ReloadError::NotLoaded(name.to_string()))?;

        let mut report = ReloadReport {
            module: name.to_string(),
            actions: Vec::with_capacity(actions.len()),
        };
        for action in &actions {
            log::debug!("{}", action);
            report.actions.push(action.to_string());
            if action.kind() == NodeKind::Module {
                let dependent = &action.node().name;
                let nested = self.patch_module(dependent).map_err(|e| ReloadError::Partial {
                    module: dependent.clone(),
                    reason: e.to_string(),
                })?;
                report.actions.extend(nested);
            } else {
                action.apply(&live);
            }
        }
        Ok(report)
    }

    /// One diff-and-apply pass over a dependent module, without further fan-out.
    fn patch_module(&self, name: &str) -> Result<Vec<String>, ReloadError> {
        let live = self
            .registry
            .get(name)
            .ok_or_else(|| ReloadError::NotLoaded(name.to_string()))?;
        let fresh = self.load_fresh(name)?;
        let actions = diff_modules(&live, &fresh);
        for action in &actions {
            log::debug!("  {}", action);
            action.apply(&live);
        }
        Ok(actions.iter().map(|a| format!("  {}", a)).collect())
    }

    fn load_fresh(&self, name: &str) -> Result<Arc<ModuleObj>, ReloadError> {
        self.registry
            .load_fresh(name)
            .map_err(|source| ReloadError::Import {
                module: name.to_string(),
                source,
            })
    }
}

/// The ordered action list turning `live` into `fresh`.
pub fn diff_modules(live: &Arc<ModuleObj>, fresh: &Arc<ModuleObj>) -> Vec<Action> {
    let old = build_module_tree(live);
    let new = build_module_tree(fresh);
    let mut actions = Vec::new();
    diff_children(&old, &new, &mut actions);
    actions
}

fn diff_children(old: &Node, new: &Node, out: &mut Vec<Action>) {
    let Some(parent) = Container::from_value(&old.value) else {
        return;
    };
    let fresh_container = Container::from_value(&new.value);

    for (key, child) in &new.children {
        if !old.children.contains_key(key) {
            out.push(Action::Add {
                parent: parent.clone(),
                node: child.clone(),
            });
        }
    }

    for (key, child) in &old.children {
        if new.children.contains_key(key) {
            continue;
        }
        // Still bound in the fresh copy, just not owned by this module any more
        // (e.g. now imported from elsewhere): rebind instead of deleting.
        match fresh_container.as_ref().and_then(|c| c.get(key)) {
            Some(value) => out.push(Action::Update {
                parent: parent.clone(),
                old: child.clone(),
                new: Node {
                    value,
                    children: Default::default(),
                    ..child.clone()
                },
            }),
            None => out.push(Action::Delete {
                parent: parent.clone(),
                node: child.clone(),
            }),
        }
    }

    for (key, old_child) in &old.children {
        if let Some(new_child) = new.children.get(key) {
            update_actions(&parent, old_child, new_child, out);
        }
    }
}

fn update_actions(parent: &Container, old: &Node, new: &Node, out: &mut Vec<Action>) {
    let update = || Action::Update {
        parent: parent.clone(),
        old: old.clone(),
        new: new.clone(),
    };

    if old.kind != new.kind {
        out.push(update());
        return;
    }

    match old.kind {
        NodeKind::Function | NodeKind::Method => {
            if let (Value::Func(a), Value::Func(b)) = (&old.value, &new.value) {
                if a.code().fingerprint() != b.code().fingerprint() {
                    out.push(update());
                }
            }
        }
        NodeKind::Variable | NodeKind::DictionaryItem => {
            if !old.value.same_value(&new.value) {
                out.push(update());
            }
        }
        NodeKind::Class | NodeKind::Dictionary => diff_children(old, new, out),
        NodeKind::Import | NodeKind::Module => {}
    }
}
