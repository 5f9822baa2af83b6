// src/core/projector.rs

use super::{tree::EnvTree, validator::ValidationError};
use crate::script::Value;
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Separator used when a list value is projected (`PATH`-style).
pub const LIST_SEPARATOR: &str = if cfg!(target_os = "windows") { ";" } else { ":" };

#[derive(Error, Debug)]
pub enum ProjectorError {
    #[error("BadValue: '{key}' cannot be dumped, its value contains {reason}.")]
    BadValue { key: String, reason: &'static str },
    #[error("Could not write dump file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A mutable table of environment variables: the process environment or the
/// host shell's variables.
pub trait VariableSurface {
    fn variable(&self, key: &str) -> Option<String>;
    fn set_variable(&mut self, key: &str, value: &str);
    fn unset_variable(&mut self, key: &str);
}

/// The environment handed to every child process.
///
/// Seeded from the real process environment once; the real one is never
/// written to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEnv {
    vars: BTreeMap<String, String>,
}

impl ProcessEnv {
    pub fn from_current() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn to_hash_map(&self) -> HashMap<String, String> {
        self.vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl VariableSurface for ProcessEnv {
    fn variable(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn set_variable(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    fn unset_variable(&mut self, key: &str) {
        self.vars.remove(key);
    }
}

/// Renders a leaf value as an environment string. Lists are joined with the
/// platform path separator.
pub fn render(value: &Value) -> String {
    match value {
        Value::List(items) => items.iter().map(render).collect::<Vec<_>>().join(LIST_SEPARATOR),
        other => other.to_string(),
    }
}

/// Snapshots every leaf into `(exported key, value)` pairs.
///
/// Null leaves are skipped. A computed leaf whose getter fails projects the
/// text of its error.
pub fn project(tree: &EnvTree) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for leaf in tree.leaves() {
        let key = leaf.exported_key(&tree.name);
        match tree.read(leaf) {
            Ok(Some(value)) => pairs.push((key, render(&value))),
            Ok(None) => {}
            Err(source) => {
                let error = ValidationError::ComputedVar {
                    name: leaf.full_name(&tree.name),
                    source,
                };
                pairs.push((key, error.to_string()));
            }
        }
    }
    pairs
}

// --- Activation journal ---

/// Prior values of the keys an overlay touched; `None` means unset.
type Journal = Vec<(String, Option<String>)>;

enum ProjectionState {
    Inactive,
    Active { process: Journal, shell: Journal },
}

/// Overlays projected pairs on the process and shell surfaces and restores
/// them exactly on deactivation.
pub struct Projector {
    state: ProjectionState,
}

impl std::fmt::Debug for Projector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projector")
            .field("active", &self.is_active())
            .finish()
    }
}

impl Default for Projector {
    fn default() -> Self {
        Self::new()
    }
}

impl Projector {
    pub fn new() -> Self {
        Self {
            state: ProjectionState::Inactive,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ProjectionState::Active { .. })
    }

    /// Applies `pairs` to both surfaces. An active overlay is restored first.
    pub fn activate(
        &mut self,
        pairs: &[(String, String)],
        process: &mut dyn VariableSurface,
        shell: &mut dyn VariableSurface,
    ) {
        self.deactivate(process, shell);
        let process_journal = overlay(pairs, process);
        let shell_journal = overlay(pairs, shell);
        log::debug!("Projected {} variables.", pairs.len());
        self.state = ProjectionState::Active {
            process: process_journal,
            shell: shell_journal,
        };
    }

    /// Puts back what `activate` replaced. A no-op when inactive.
    pub fn deactivate(&mut self, process: &mut dyn VariableSurface, shell: &mut dyn VariableSurface) {
        if let ProjectionState::Active {
            process: process_journal,
            shell: shell_journal,
        } = std::mem::replace(&mut self.state, ProjectionState::Inactive)
        {
            restore(process_journal, process);
            restore(shell_journal, shell);
        }
    }
}

fn overlay(pairs: &[(String, String)], surface: &mut dyn VariableSurface) -> Journal {
    let mut journal: Journal = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        if !journal.iter().any(|(k, _)| k == key) {
            journal.push((key.clone(), surface.variable(key)));
        }
        surface.set_variable(key, value);
    }
    journal
}

fn restore(journal: Journal, surface: &mut dyn VariableSurface) {
    // Reverse order so the earliest snapshot of a key wins.
    for (key, previous) in journal.into_iter().rev() {
        match previous {
            Some(value) => surface.set_variable(&key, &value),
            None => surface.unset_variable(&key),
        }
    }
}

// --- Output formats ---

/// `export KEY="value"` lines for `dry-run`.
pub fn format_exports(pairs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('$', "\\$")
            .replace('`', "\\`");
        out.push_str(&format!("export {}=\"{}\"\n", key, escaped));
    }
    out
}

/// Canonical dot-env text: one `KEY="value"` per line.
pub fn format_dump(pairs: &[(String, String)]) -> Result<String, ProjectorError> {
    let mut out = String::new();
    for (key, value) in pairs {
        let reason = if value.contains('"') {
            Some("a double quote")
        } else if value.contains('\n') || value.contains('\r') {
            Some("a line break")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(ProjectorError::BadValue {
                key: key.clone(),
                reason,
            });
        }
        out.push_str(&format!("{}=\"{}\"\n", key, value));
    }
    Ok(out)
}

/// Writes the dump atomically: a temp file in the same directory is renamed
/// over `path`.
pub fn write_dump(path: &Path, pairs: &[(String, String)]) -> Result<(), ProjectorError> {
    let content = format_dump(pairs)?;
    let io_err = |source| ProjectorError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(content.as_bytes()).map_err(io_err)?;
    file.persist(path).map_err(|e| io_err(e.error))?;
    log::info!("Dump written to '{}'.", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ModuleObj;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_activate_then_deactivate_restores_byte_for_byte() {
        let mut process = ProcessEnv::from_pairs([("PATH", "/usr/bin"), ("HOME", "/home/me")]);
        let mut shell = ProcessEnv::from_pairs([("PROMPT_STYLE", "x")]);
        let process_before = process.clone();
        let shell_before = shell.clone();

        let mut projector = Projector::new();
        projector.activate(
            &pairs(&[("PATH", "/p/bin:/usr/bin"), ("SANDBOX_STAGE", "local")]),
            &mut process,
            &mut shell,
        );
        assert!(projector.is_active());
        assert_eq!(process.get("PATH"), Some("/p/bin:/usr/bin"));
        assert_eq!(shell.variable("SANDBOX_STAGE").as_deref(), Some("local"));

        projector.deactivate(&mut process, &mut shell);
        assert_eq!(process, process_before);
        assert_eq!(shell, shell_before);
    }

    #[test]
    fn test_reactivation_restores_the_first_snapshot() {
        let mut process = ProcessEnv::from_pairs([("A", "orig")]);
        let mut shell = ProcessEnv::default();
        let before = process.clone();

        let mut projector = Projector::new();
        projector.activate(&pairs(&[("A", "one"), ("A", "two")]), &mut process, &mut shell);
        assert_eq!(process.get("A"), Some("two"));
        projector.activate(&pairs(&[("B", "new")]), &mut process, &mut shell);
        assert_eq!(process.get("A"), Some("orig"));

        projector.deactivate(&mut process, &mut shell);
        assert_eq!(process, before);
    }

    #[test]
    fn test_project_renders_lists_and_computed_errors() {
        let scope = Arc::new(ModuleObj::new("<definition>", None, ""));
        let mut tree = EnvTree::new("sandbox", PathBuf::from("/p"), scope);
        let origin = PathBuf::from("env_comm.toml");

        let path = tree.entry(&[], "path", &origin);
        path.raw = true;
        path.type_decl = Some("list[str]".to_string());
        path.value = Some(Value::list(vec![Value::str("/a"), Value::str("/b")]));

        let broken = tree.entry(&[], "broken", &origin);
        broken.type_decl = Some("int".to_string());
        broken.compute = Some("1 / 0".to_string());

        tree.entry(&[], "unset", &origin).optional = true;

        let projected = project(&tree);
        assert_eq!(projected.len(), 2);
        assert_eq!(projected[0], ("PATH".to_string(), format!("/a{}/b", LIST_SEPARATOR)));
        assert_eq!(projected[1].0, "SANDBOX_BROKEN");
        assert!(projected[1].1.starts_with("ComputedVarError"));
        assert!(projected[1].1.contains("division by zero"));
    }

    #[test]
    fn test_formats() {
        let items = pairs(&[("A", "1"), ("B", "x y")]);
        assert_eq!(format_exports(&items), "export A=\"1\"\nexport B=\"x y\"\n");
        assert_eq!(format_dump(&items).unwrap(), "A=\"1\"\nB=\"x y\"\n");

        let bad = pairs(&[("Q", "say \"hi\"")]);
        assert!(matches!(format_dump(&bad), Err(ProjectorError::BadValue { key, .. }) if key == "Q"));
        assert_eq!(format_exports(&bad), "export Q=\"say \\\"hi\\\"\"\n");
    }

    #[test]
    fn test_write_dump_is_atomic_and_rejects_bad_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env_local");
        write_dump(&path, &pairs(&[("A", "1")])).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "A=\"1\"\n");

        let err = write_dump(&path, &pairs(&[("A", "line\nbreak")])).unwrap_err();
        assert!(matches!(err, ProjectorError::BadValue { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "A=\"1\"\n");
    }
}
