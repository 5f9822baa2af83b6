// src/core/tree.rs

use super::types::TypeSpec;
use crate::script::{
    ModuleObj, ScriptError, ScriptHost, Value,
    interp::{self, Scope},
    parser,
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

/// A typed variable leaf of the environment tree.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub name: String,
    /// Enclosing groups, outermost first.
    pub groups: Vec<String>,
    pub type_decl: Option<String>,
    pub raw: bool,
    pub optional: bool,
    /// Stored value (for computed leaves: the value handed to the getter).
    pub value: Option<Value>,
    /// Getter expression of a computed leaf.
    pub compute: Option<String>,
    /// The last layer that declared or overrode this leaf.
    pub origin: PathBuf,
}

impl Leaf {
    pub fn new(name: &str, groups: Vec<String>, origin: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            groups,
            type_decl: None,
            raw: false,
            optional: false,
            value: None,
            compute: None,
            origin,
        }
    }

    /// Dotted name inside the environment, without the root.
    pub fn relative_name(&self) -> String {
        let mut parts = self.groups.clone();
        parts.push(self.name.clone());
        parts.join(".")
    }

    /// `<root>.<group>.<leaf>` for namespaced leaves, just `<leaf>` for raw ones.
    pub fn full_name(&self, root: &str) -> String {
        if self.raw {
            self.name.clone()
        } else {
            format!("{}.{}", root, self.relative_name())
        }
    }

    /// The environment variable this leaf projects to.
    pub fn exported_key(&self, root: &str) -> String {
        self.full_name(root)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect()
    }

    pub fn type_spec(&self) -> Option<Result<TypeSpec, String>> {
        self.type_decl.as_deref().map(TypeSpec::parse)
    }
}

/// The composed, typed variable tree of one environment.
#[derive(Debug, Clone)]
pub struct EnvTree {
    pub name: String,
    pub root: PathBuf,
    /// Leaves by relative name; `order` keeps declaration order.
    leaves: HashMap<String, Leaf>,
    order: Vec<String>,
    scope: Arc<ModuleObj>,
    host: Option<Arc<ScriptHost>>,
}

impl EnvTree {
    pub fn new(name: impl Into<String>, root: PathBuf, scope: Arc<ModuleObj>) -> Self {
        Self {
            name: name.into(),
            root,
            leaves: HashMap::new(),
            order: Vec::new(),
            scope,
            host: None,
        }
    }

    /// Runs computed getters against `host` instead of the current process.
    pub fn with_host(mut self, host: Option<Arc<ScriptHost>>) -> Self {
        self.host = host;
        self
    }

    pub fn host(&self) -> Option<&Arc<ScriptHost>> {
        self.host.as_ref()
    }

    /// Leaves in declaration order.
    pub fn leaves(&self) -> impl Iterator<Item = &Leaf> {
        self.order.iter().filter_map(|name| self.leaves.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The expression scope of the definition (imports, `root`, `stage`).
    pub fn scope(&self) -> &Arc<ModuleObj> {
        &self.scope
    }

    pub fn find(&self, relative_name: &str) -> Option<&Leaf> {
        self.leaves.get(relative_name)
    }

    pub fn find_mut(&mut self, relative_name: &str) -> Option<&mut Leaf> {
        self.leaves.get_mut(relative_name)
    }

    /// Returns the leaf at `relative_name`, creating it if absent.
    pub fn entry(&mut self, groups: &[String], name: &str, origin: &Path) -> &mut Leaf {
        let mut relative: Vec<String> = groups.to_vec();
        relative.push(name.to_string());
        let relative = relative.join(".");
        let order = &mut self.order;
        self.leaves.entry(relative).or_insert_with_key(|key| {
            order.push(key.clone());
            Leaf::new(name, groups.to_vec(), origin.to_path_buf())
        })
    }

    /// Reads a leaf. Computed leaves evaluate their getter with `value` bound
    /// to the stored value. Path-typed values are expanded.
    pub fn read(&self, leaf: &Leaf) -> Result<Option<Value>, ScriptError> {
        let value = match &leaf.compute {
            Some(getter) => {
                let expr = parser::parse_expr(getter, &leaf.relative_name())?;
                let scope = Scope::new(Some(Arc::clone(&self.scope)))
                    .with_host(self.host.clone())
                    .with_local("value", leaf.value.clone().unwrap_or(Value::Null));
                Some(interp::eval(&expr, &scope)?)
            }
            None => leaf.value.clone(),
        };

        let value = value.filter(|v| !v.is_null());
        Ok(match (value, leaf.type_spec()) {
            (Some(value), Some(Ok(spec))) => Some(spec.coerce(value, &self.root)),
            (value, _) => value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> EnvTree {
        EnvTree::new("sandbox", PathBuf::from("/p"), Arc::new(ModuleObj::new("<definition>", None, "")))
    }

    #[test]
    fn test_names_and_keys() {
        let mut tree = tree();
        let origin = PathBuf::from("env_comm.toml");
        tree.entry(&["python".to_string()], "version", &origin);
        let leaf = tree.find("python.version").unwrap();
        assert_eq!(leaf.full_name("sandbox"), "sandbox.python.version");
        assert_eq!(leaf.exported_key("sandbox"), "SANDBOX_PYTHON_VERSION");

        let raw = tree.entry(&["python".to_string()], "version", &origin);
        raw.raw = true;
        assert_eq!(raw.exported_key("my-env"), "VERSION");
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_computed_leaf_reads_through_getter() {
        let mut tree = tree();
        let origin = PathBuf::from("env_comm.toml");
        let leaf = tree.entry(&[], "greeting", &origin);
        leaf.value = Some(Value::str("world"));
        leaf.compute = Some("\"hello \" + value".to_string());
        let leaf = tree.find("greeting").unwrap().clone();
        assert_eq!(tree.read(&leaf).unwrap().unwrap().to_string(), "hello world");
    }

    #[test]
    fn test_failing_getter_is_an_error() {
        let mut tree = tree();
        let leaf = tree.entry(&[], "broken", Path::new("x"));
        leaf.compute = Some("1 / 0".to_string());
        let leaf = tree.find("broken").unwrap().clone();
        assert_eq!(tree.read(&leaf).unwrap_err(), ScriptError::DivisionByZero);
    }

    #[test]
    fn test_getters_read_the_host_variables() {
        let host = ScriptHost {
            env: HashMap::from([("STRATA_TEST_USER".to_string(), "alice".to_string())]),
            ..ScriptHost::from_process()
        };
        let mut tree = tree().with_host(Some(Arc::new(host)));
        let leaf = tree.entry(&[], "user", Path::new("x"));
        leaf.compute = Some("getenv(\"STRATA_TEST_USER\")".to_string());
        let leaf = tree.find("user").unwrap().clone();
        assert_eq!(tree.read(&leaf).unwrap().unwrap().to_string(), "alice");
        assert_eq!(tree.leaves().count(), 1);
    }
}
