// src/core/stage.rs

use crate::constants::{DEFINITION_EXTENSION, DEFINITION_PREFIX};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Built-in stages: name, priority and display glyph.
const BUILTIN_STAGES: &[(&str, i32, &str)] = &[
    ("local", 100, "🐣"),
    ("comm", 90, ""),
    ("test", 80, "🛠"),
    ("ci", 70, "🧪"),
    ("stage", 60, "🤖"),
    ("prod", 50, "🔥"),
];

#[derive(Error, Debug)]
pub enum StageError {
    #[error("No definition file for stage '{stage}' found in '{dir}' or any parent directory.")]
    EnvFileMissing { stage: String, dir: PathBuf },
    #[error("No definition files (env_*.toml) found in '{0}' or any parent directory.")]
    NoDefinitions(PathBuf),
    #[error("Could not read directory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub name: String,
    pub priority: i32,
    pub glyph: String,
}

impl Stage {
    /// A stage by name. Unknown stages are valid with priority 0 and no glyph.
    pub fn named(name: &str) -> Self {
        BUILTIN_STAGES
            .iter()
            .find(|(builtin, _, _)| *builtin == name)
            .map(|(name, priority, glyph)| Self {
                name: name.to_string(),
                priority: *priority,
                glyph: glyph.to_string(),
            })
            .unwrap_or_else(|| Self {
                name: name.to_string(),
                priority: 0,
                glyph: String::new(),
            })
    }

    pub fn file_name(&self) -> String {
        definition_file_name(&self.name)
    }
}

/// A definition file found on disk, with the stage parsed from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFile {
    pub path: PathBuf,
    pub stage: Stage,
}

pub fn definition_file_name(stage: &str) -> String {
    format!("{}{}.{}", DEFINITION_PREFIX, stage, DEFINITION_EXTENSION)
}

/// Extracts `<stage>` from `env_<stage>.toml`.
pub fn stage_from_file_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(DEFINITION_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let stage = stem.strip_prefix(DEFINITION_PREFIX)?;
    (!stage.is_empty()).then(|| stage.to_string())
}

/// Every definition file directly inside `dir`, sorted by stage name.
pub fn scan_dir(dir: &Path) -> Result<Vec<StageFile>, StageError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(StageError::Io {
                path: dir.to_path_buf(),
                source: e,
            });
        }
    };

    let mut files: Vec<StageFile> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let stage = stage_from_file_name(&path)?;
            Some(StageFile {
                path,
                stage: Stage::named(&stage),
            })
        })
        .collect();
    files.sort_by(|a, b| a.stage.name.cmp(&b.stage.name));
    Ok(files)
}

/// Finds the definition file to load, searching `start` and its ancestors.
///
/// With an explicit stage, the closest file of that stage wins. Otherwise the
/// closest directory holding any definition file is used, and within it the
/// stage with the highest priority (ties broken by stage name).
pub fn resolve(start: &Path, stage: Option<&str>) -> Result<StageFile, StageError> {
    let start = dunce::canonicalize(start).unwrap_or_else(|_| start.to_path_buf());

    for dir in start.ancestors() {
        let files = scan_dir(dir)?;
        if files.is_empty() {
            continue;
        }
        match stage {
            Some(wanted) => {
                if let Some(found) = files.into_iter().find(|f| f.stage.name == wanted) {
                    log::debug!("Resolved stage '{}' to '{}'.", wanted, found.path.display());
                    return Ok(found);
                }
            }
            None => {
                // Ties go to the lexically first stage name.
                let best = files
                    .into_iter()
                    .max_by(|a, b| {
                        a.stage
                            .priority
                            .cmp(&b.stage.priority)
                            .then_with(|| b.stage.name.cmp(&a.stage.name))
                    })
                    .ok_or_else(|| StageError::NoDefinitions(start.clone()))?;
                log::debug!(
                    "Resolved default stage '{}' to '{}'.",
                    best.stage.name,
                    best.path.display()
                );
                return Ok(best);
            }
        }
    }

    Err(match stage {
        Some(wanted) => StageError::EnvFileMissing {
            stage: wanted.to_string(),
            dir: start,
        },
        None => StageError::NoDefinitions(start),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "").unwrap();
    }

    #[test]
    fn test_highest_priority_wins_without_explicit_stage() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "env_test.toml");
        touch(dir.path(), "env_local.toml");
        touch(dir.path(), "env_comm.toml");

        let found = resolve(dir.path(), None).unwrap();
        assert_eq!(found.stage.name, "local");
        assert!(found.path.ends_with("env_local.toml"));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "env_alpha.toml");
        touch(dir.path(), "env_beta.toml");
        let first = resolve(dir.path(), None).unwrap();
        for _ in 0..5 {
            assert_eq!(resolve(dir.path(), None).unwrap(), first);
        }
        // Equal priority: lexical order decides.
        assert_eq!(first.stage.name, "alpha");
    }

    #[test]
    fn test_explicit_stage_searches_ancestors() {
        let root = tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        touch(root.path(), "env_prod.toml");
        touch(&root.path().join("a"), "env_local.toml");

        let found = resolve(&nested, Some("prod")).unwrap();
        assert!(found.path.ends_with("env_prod.toml"));

        // Without a stage, the closest directory wins even if a farther one exists.
        let closest = resolve(&nested, None).unwrap();
        assert_eq!(closest.stage.name, "local");
    }

    #[test]
    fn test_missing_stage_fails() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "env_local.toml");
        let err = resolve(dir.path(), Some("ci")).unwrap_err();
        assert!(matches!(err, StageError::EnvFileMissing { ref stage, .. } if stage == "ci"));
    }

    #[test]
    fn test_file_name_parsing() {
        assert_eq!(stage_from_file_name(Path::new("env_ci.toml")).as_deref(), Some("ci"));
        assert_eq!(stage_from_file_name(Path::new(".env_ci")), None);
        assert_eq!(stage_from_file_name(Path::new("env_.toml")), None);
        assert_eq!(stage_from_file_name(Path::new("env_ci.py")), None);
    }
}
