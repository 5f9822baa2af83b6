// src/core/loader.rs

use super::{
    cache,
    stage::{self, Stage},
};
use crate::{
    constants::COMM_STAGE,
    models::DefinitionFile,
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read definition file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to import definition file '{path}': {source}")]
    DefinitionImport {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("Parent layer '{parent}' declared in '{path}' does not exist.")]
    MissingParent { path: PathBuf, parent: PathBuf },
    #[error("Inheritance cycle detected: {0}")]
    Cycle(String),
    #[error("Unknown plugin '{plugin}' declared in '{path}'.")]
    UnknownPlugin { path: PathBuf, plugin: String },
}

impl LoadError {
    /// The file the error is about.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. }
            | Self::DefinitionImport { path, .. }
            | Self::MissingParent { path, .. }
            | Self::UnknownPlugin { path, .. } => Some(path),
            Self::Cycle(_) => None,
        }
    }
}

/// One imported definition file.
#[derive(Debug, Clone)]
pub struct DefinitionLayer {
    /// Absolute path; the layer's identity.
    pub path: PathBuf,
    /// Directory holding the file. Relative paths in the file are anchored here.
    pub root: PathBuf,
    /// Stage parsed from the file name, if it follows `env_<stage>.toml`.
    pub stage: Option<Stage>,
    pub file: DefinitionFile,
    pub content_hash: String,
}

impl DefinitionLayer {
    /// The parent layer file, explicit or implied.
    ///
    /// Without an explicit `parent`, a stage file inherits from the
    /// `env_comm.toml` sitting next to it, if any.
    pub fn parent_path(&self) -> Option<PathBuf> {
        if let Some(parent) = &self.file.env.parent {
            return Some(self.root.join(parent));
        }
        let stage = self.stage.as_ref()?;
        if stage.name == COMM_STAGE {
            return None;
        }
        let comm = self.root.join(stage::definition_file_name(COMM_STAGE));
        comm.is_file().then_some(comm)
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

/// Reads and parses a definition file. Every call reads the file again, so
/// a reload always sees a fresh layer.
pub fn load_layer(path: &Path) -> Result<DefinitionLayer, LoadError> {
    let path = dunce::canonicalize(path).map_err(|e| LoadError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let content = fs::read_to_string(&path).map_err(|e| LoadError::Read {
        path: path.clone(),
        source: e,
    })?;
    let file: DefinitionFile = toml::from_str(&content).map_err(|e| LoadError::DefinitionImport {
        path: path.clone(),
        source: Box::new(e),
    })?;

    let root = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let stage = stage::stage_from_file_name(&path).map(|name| Stage::named(&name));
    log::debug!("Loaded definition layer '{}'.", path.display());

    Ok(DefinitionLayer {
        content_hash: cache::content_hash(content.as_bytes()),
        path,
        root,
        stage,
        file,
    })
}

/// Loads `path` and all of its parents, root-most first.
pub fn load_chain(path: &Path) -> Result<Vec<DefinitionLayer>, LoadError> {
    let mut chain: Vec<DefinitionLayer> = Vec::new();
    let mut next = Some(path.to_path_buf());

    while let Some(current) = next {
        if !current.is_file() {
            let child = chain.last().map(|l| l.path.clone()).unwrap_or_else(|| current.clone());
            return Err(if chain.is_empty() {
                LoadError::Read {
                    path: current,
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }
            } else {
                LoadError::MissingParent {
                    path: child,
                    parent: current,
                }
            });
        }

        let layer = load_layer(&current)?;
        if chain.iter().any(|l| l.path == layer.path) {
            let mut names: Vec<String> = chain.iter().map(|l| l.path.display().to_string()).collect();
            names.push(layer.path.display().to_string());
            return Err(LoadError::Cycle(names.join(" -> ")));
        }
        next = layer.parent_path();
        chain.push(layer);
    }

    chain.reverse();
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_chain_uses_implicit_comm_parent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("env_comm.toml"), "[env]\nname = \"sandbox\"\n").unwrap();
        fs::write(dir.path().join("env_local.toml"), "").unwrap();

        let chain = load_chain(&dir.path().join("env_local.toml")).unwrap();
        let stages: Vec<String> = chain
            .iter()
            .map(|l| l.stage.as_ref().unwrap().name.clone())
            .collect();
        assert_eq!(stages, vec!["comm", "local"]);
        assert_eq!(chain[0].file.env.name.as_deref(), Some("sandbox"));
    }

    #[test]
    fn test_explicit_parent_and_missing_parent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("base.toml"), "").unwrap();
        fs::write(dir.path().join("env_ci.toml"), "[env]\nparent = \"base.toml\"\n").unwrap();
        fs::write(dir.path().join("env_prod.toml"), "[env]\nparent = \"nope.toml\"\n").unwrap();

        let chain = load_chain(&dir.path().join("env_ci.toml")).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].stage.is_none());

        let err = load_chain(&dir.path().join("env_prod.toml")).unwrap_err();
        assert!(matches!(err, LoadError::MissingParent { .. }));
    }

    #[test]
    fn test_cycle_is_detected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.toml"), "[env]\nparent = \"b.toml\"\n").unwrap();
        fs::write(dir.path().join("b.toml"), "[env]\nparent = \"a.toml\"\n").unwrap();
        assert!(matches!(load_chain(&dir.path().join("a.toml")), Err(LoadError::Cycle(_))));
    }

    #[test]
    fn test_syntax_error_carries_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env_local.toml");
        fs::write(&path, "[vars.x\n").unwrap();
        let err = load_layer(&path).unwrap_err();
        assert!(matches!(err, LoadError::DefinitionImport { .. }));
        assert!(err.path().unwrap().ends_with("env_local.toml"));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env_local.toml");
        fs::write(&path, "[vars.x]\ntype = \"str\"\nvalu = \"typo\"\n").unwrap();
        assert!(matches!(load_layer(&path), Err(LoadError::DefinitionImport { .. })));
    }
}
