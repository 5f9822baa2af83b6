// src/reload/deps.rs

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    sync::{
        RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

/// Import edges between script modules, recorded by the registry's import
/// procedure as `importee -> importers`.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    edges: RwLock<BTreeMap<String, Vec<String>>>,
    blacklist: RwLock<BTreeSet<String>>,
    enabled: AtomicBool,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts recording import edges. Blacklisted modules are still recorded
    /// but never scheduled for reload.
    pub fn enable(&self, blacklist: impl IntoIterator<Item = String>) {
        if let Ok(mut slot) = self.blacklist.write() {
            *slot = blacklist.into_iter().collect();
        }
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Records that `importer` imported `importee`.
    pub fn record(&self, importee: &str, importer: &str) {
        if !self.is_enabled() || importee == importer {
            return;
        }
        if let Ok(mut edges) = self.edges.write() {
            let importers = edges.entry(importee.to_string()).or_default();
            if !importers.iter().any(|i| i == importer) {
                log::trace!("Dependency recorded: {} -> {}", importee, importer);
                importers.push(importer.to_string());
            }
        }
    }

    pub fn direct_dependents(&self, module: &str) -> Vec<String> {
        self.edges
            .read()
            .ok()
            .and_then(|edges| edges.get(module).cloned())
            .unwrap_or_default()
    }

    /// Every module that transitively imports `module`, ordered so that a
    /// module always comes after the modules it imports. Cycles are cut.
    pub fn get_dependencies(&self, module: &str) -> Vec<String> {
        let Ok(edges) = self.edges.read() else {
            return Vec::new();
        };

        // 1. Reachable set, in discovery order.
        let mut discovered: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::from([module]);
        let mut queue: VecDeque<&str> = VecDeque::from([module]);
        while let Some(current) = queue.pop_front() {
            for importer in edges.get(current).into_iter().flatten() {
                if seen.insert(importer.as_str()) {
                    discovered.push(importer.clone());
                    queue.push_back(importer.as_str());
                }
            }
        }

        // 2. Kahn's algorithm restricted to the reachable set.
        let members: HashSet<&str> = discovered.iter().map(String::as_str).collect();
        let mut indegree: HashMap<&str, usize> = members.iter().map(|m| (*m, 0)).collect();
        for name in &discovered {
            for importer in edges.get(name.as_str()).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(importer.as_str()) {
                    *count += 1;
                }
            }
        }

        let mut ordered: Vec<String> = Vec::with_capacity(discovered.len());
        let mut placed: HashSet<&str> = HashSet::new();
        while ordered.len() < discovered.len() {
            let next = discovered
                .iter()
                .find(|name| !placed.contains(name.as_str()) && indegree.get(name.as_str()) == Some(&0))
                // A cycle remains: break it at the earliest discovered module.
                .or_else(|| discovered.iter().find(|name| !placed.contains(name.as_str())));
            let Some(next) = next else { break };

            placed.insert(next.as_str());
            ordered.push(next.clone());
            for importer in edges.get(next.as_str()).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(importer.as_str()) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        ordered
    }

    /// The dependents of `module` that a reload should fan out to.
    pub fn reload_targets(&self, module: &str) -> Vec<String> {
        let blacklist = self.blacklist.read().map(|b| b.clone()).unwrap_or_default();
        self.get_dependencies(module)
            .into_iter()
            .filter(|name| !blacklist.contains(name))
            .collect()
    }

    /// Drops a module from the graph, as importee and as importer.
    pub fn forget(&self, module: &str) {
        if let Ok(mut edges) = self.edges.write() {
            edges.remove(module);
            for importers in edges.values_mut() {
                importers.retain(|i| i != module);
            }
        }
    }
}
