// src/script/registry.rs

use super::{
    MODULE_EXTENSION, ScriptError, ScriptHost,
    interp::{self, Importer},
    parser,
    value::ModuleObj,
};
use crate::reload::deps::DependencyTracker;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};
use walkdir::WalkDir;

/// Loaded script modules, keyed by dotted module name.
///
/// `import` is the only way modules enter the registry during normal
/// execution, and it is also where import edges are fed to the dependency
/// tracker.
#[derive(Debug)]
pub struct ModuleRegistry {
    roots: RwLock<Vec<PathBuf>>,
    modules: RwLock<HashMap<String, Arc<ModuleObj>>>,
    tracker: Arc<DependencyTracker>,
    host: RwLock<Option<Arc<ScriptHost>>>,
}

impl ModuleRegistry {
    pub fn new(tracker: Arc<DependencyTracker>) -> Self {
        Self {
            roots: RwLock::new(Vec::new()),
            modules: RwLock::new(HashMap::new()),
            tracker,
            host: RwLock::new(None),
        }
    }

    pub fn with_host(self, host: ScriptHost) -> Self {
        self.set_host(Some(Arc::new(host)));
        self
    }

    /// Session that module bodies and their functions run against.
    pub fn set_host(&self, host: Option<Arc<ScriptHost>>) {
        if let Ok(mut slot) = self.host.write() {
            *slot = host;
        }
    }

    pub fn tracker(&self) -> &Arc<DependencyTracker> {
        &self.tracker
    }

    pub fn set_roots(&self, roots: Vec<PathBuf>) {
        if let Ok(mut slot) = self.roots.write() {
            *slot = roots;
        }
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots.read().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleObj>> {
        self.modules.read().ok()?.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .modules
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Finds the file backing a dotted module name in the first root that has it.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative: PathBuf = name.split('.').collect();
        self.roots()
            .into_iter()
            .map(|root| root.join(&relative).with_extension(MODULE_EXTENSION))
            .find(|candidate| candidate.is_file())
    }

    /// Inverse of [`resolve`](Self::resolve): the dotted name of a module file.
    pub fn module_name_for(&self, path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some(MODULE_EXTENSION) {
            return None;
        }
        let path = dunce::simplified(path);
        self.roots().into_iter().find_map(|root| {
            let relative = path.strip_prefix(dunce::simplified(&root)).ok()?;
            let parts: Vec<String> = relative
                .with_extension("")
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            (!parts.is_empty()).then(|| parts.join("."))
        })
    }

    /// Every module file under the roots, as dotted names.
    pub fn discover(&self) -> Vec<String> {
        let mut names = Vec::new();
        for root in self.roots() {
            for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
                if entry.file_type().is_file() {
                    if let Some(name) = self.module_name_for(entry.path()) {
                        if !names.contains(&name) {
                            names.push(name);
                        }
                    }
                }
            }
        }
        names.sort();
        names
    }

    fn read_source(&self, name: &str) -> Result<(PathBuf, String), ScriptError> {
        let path = self.resolve(name).ok_or_else(|| ScriptError::Import {
            module: name.to_string(),
            reason: "no such module".to_string(),
        })?;
        let source = fs::read_to_string(&path).map_err(|e| ScriptError::Import {
            module: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok((path, source))
    }

    /// Loads `name` from disk into a new module object without registering it.
    /// Its own imports resolve against the live registry.
    pub fn load_fresh(&self, name: &str) -> Result<Arc<ModuleObj>, ScriptError> {
        let (path, source) = self.read_source(name)?;
        let program = parser::parse_program(&source, &path.to_string_lossy())?;
        let module = Arc::new(ModuleObj::new(name, Some(path), source));
        interp::exec_module(&program, &module, self, Some(name))?;
        Ok(module)
    }

    /// Replaces the registry entry for a module. Holders of the previous
    /// object keep the stale copy.
    pub fn replace(&self, module: Arc<ModuleObj>) {
        if let Ok(mut modules) = self.modules.write() {
            modules.insert(module.name.clone(), module);
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ModuleObj>> {
        self.tracker.forget(name);
        self.modules.write().ok()?.remove(name)
    }
}

impl Importer for ModuleRegistry {
    fn host(&self) -> Option<Arc<ScriptHost>> {
        self.host.read().ok().and_then(|h| h.clone())
    }

    fn import(&self, name: &str, parent: Option<&str>) -> Result<Arc<ModuleObj>, ScriptError> {
        let module = match self.get(name) {
            Some(module) => module,
            None => {
                let (path, source) = self.read_source(name)?;
                let program = parser::parse_program(&source, &path.to_string_lossy())?;
                let module = Arc::new(ModuleObj::new(name, Some(path), source));

                // Registered before execution so that cyclic imports see the
                // partially initialized module.
                self.replace(Arc::clone(&module));
                if let Err(e) = interp::exec_module(&program, &module, self, Some(name)) {
                    if let Ok(mut modules) = self.modules.write() {
                        modules.remove(name);
                    }
                    return Err(e);
                }
                log::debug!("Module '{}' imported.", name);
                module
            }
        };

        if let Some(parent) = parent {
            if module.path.is_some() {
                self.tracker.record(name, parent);
            }
        }
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::value::Value;
    use tempfile::tempdir;

    fn registry_with(files: &[(&str, &str)]) -> (tempfile::TempDir, ModuleRegistry) {
        let dir = tempdir().unwrap();
        for (name, source) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, source).unwrap();
        }
        let tracker = Arc::new(DependencyTracker::new());
        tracker.enable(Vec::new());
        let registry = ModuleRegistry::new(tracker);
        registry.set_roots(vec![dir.path().to_path_buf()]);
        (dir, registry)
    }

    #[test]
    fn test_import_records_edges_and_caches() {
        let (_dir, registry) = registry_with(&[
            ("carwash.stm", "sprinkler_n = 3\n"),
            ("car.stm", "from carwash import sprinkler_n\ncar_sprinklers = sprinkler_n / 3\n"),
        ]);
        let car = registry.import("car", None).unwrap();
        assert!(car.get("car_sprinklers").unwrap().same_value(&Value::Int(1)));
        assert_eq!(registry.tracker().direct_dependents("carwash"), vec!["car"]);

        let again = registry.import("car", None).unwrap();
        assert!(Arc::ptr_eq(&car, &again));
    }

    #[test]
    fn test_nested_module_names() {
        let (dir, registry) = registry_with(&[("pkg/util.stm", "x = 1\n")]);
        assert_eq!(registry.discover(), vec!["pkg.util"]);
        let path = dir.path().join("pkg").join("util.stm");
        assert_eq!(registry.module_name_for(&path).as_deref(), Some("pkg.util"));
        assert!(registry.import("pkg.util", None).is_ok());
    }

    #[test]
    fn test_failed_import_is_not_registered() {
        let (_dir, registry) = registry_with(&[("bad.stm", "x = 1 / 0\n")]);
        assert_eq!(
            registry.import("bad", None).unwrap_err(),
            ScriptError::DivisionByZero
        );
        assert!(registry.get("bad").is_none());
    }

    #[test]
    fn test_module_bodies_see_the_registry_host() {
        let (dir, registry) = registry_with(&[("ports.stm", "port = getenv(\"SANDBOX_PORT\", \"none\")\n")]);
        let host = ScriptHost {
            env: HashMap::from([("SANDBOX_PORT".to_string(), "8000".to_string())]),
            cwd: dir.path().to_path_buf(),
            ..ScriptHost::from_process()
        };
        registry.set_host(Some(Arc::new(host)));
        let ports = registry.import("ports", None).unwrap();
        assert_eq!(ports.get("port").unwrap().to_string(), "8000");
    }

    #[test]
    fn test_missing_module() {
        let (_dir, registry) = registry_with(&[]);
        assert!(matches!(
            registry.import("nope", None),
            Err(ScriptError::Import { .. })
        ));
    }

    #[test]
    fn test_load_fresh_does_not_touch_registry() {
        let (dir, registry) = registry_with(&[("m.stm", "x = 1\n")]);
        let live = registry.import("m", None).unwrap();
        fs::write(dir.path().join("m.stm"), "x = 2\n").unwrap();

        let fresh = registry.load_fresh("m").unwrap();
        assert!(!Arc::ptr_eq(&live, &fresh));
        assert!(registry.get("m").unwrap().get("x").unwrap().same_value(&Value::Int(1)));
        assert!(fresh.get("x").unwrap().same_value(&Value::Int(2)));
    }
}
