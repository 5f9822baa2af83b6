// src/core/paths.rs

use crate::constants::{APP_NAME, DATA_DIR_HASH_LENGTH, HISTORY_FILENAME, SETTINGS_FILENAME};
use lazy_static::lazy_static;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

lazy_static! {
    static ref CONFIG_DIR: Mutex<Option<PathBuf>> = Mutex::new(None);
}

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not find system config directory.")]
    ConfigDirNotFound,
    #[error("Could not find system data directory.")]
    DataDirNotFound,
    #[error("Could not create directory at '{path}': {source}")]
    DirCreation {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn ensure_dir(path: &Path) -> Result<(), PathError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| PathError::DirCreation {
            path: path.display().to_string(),
            source: e,
        })?;
    }
    Ok(())
}

/// Returns the path to the configuration directory (`~/.config/strata`).
/// Creates it if it doesn't exist.
///
/// This function is memoized: the first call computes and caches the path,
/// subsequent calls return the cached value instantly.
pub fn get_config_dir() -> Result<PathBuf, PathError> {
    let mut cached = CONFIG_DIR.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(path) = &*cached {
        return Ok(path.clone());
    }

    // --- Cache miss: compute the path for the first time ---
    let config_path = dirs::config_dir()
        .ok_or(PathError::ConfigDirNotFound)?
        .join(APP_NAME);
    ensure_dir(&config_path)?;

    *cached = Some(config_path.clone());
    Ok(config_path)
}

pub fn get_settings_path() -> Result<PathBuf, PathError> {
    get_config_dir().map(|dir| dir.join(SETTINGS_FILENAME))
}

/// The per-project data directory key: a truncated blake3 hash of the
/// absolute definition-file path.
pub fn project_key(definition: &Path) -> String {
    let absolute = dunce::canonicalize(definition).unwrap_or_else(|_| definition.to_path_buf());
    let hash = blake3::hash(absolute.to_string_lossy().as_bytes());
    let mut key = hex::encode(hash.as_bytes());
    key.truncate(DATA_DIR_HASH_LENGTH);
    key
}

/// `<data dir>/strata/<project key>/`, created on demand.
pub fn get_project_data_dir(definition: &Path) -> Result<PathBuf, PathError> {
    let dir = dirs::data_dir()
        .ok_or(PathError::DataDirNotFound)?
        .join(APP_NAME)
        .join(project_key(definition));
    ensure_dir(&dir)?;
    Ok(dir)
}

pub fn get_history_path(definition: &Path) -> Result<PathBuf, PathError> {
    get_project_data_dir(definition).map(|dir| dir.join(HISTORY_FILENAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_project_key_is_stable_and_short() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("env_local.toml");
        fs::write(&file, "").unwrap();

        let key = project_key(&file);
        assert_eq!(key.len(), DATA_DIR_HASH_LENGTH);
        assert_eq!(key, project_key(&file));
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_different_definitions_get_different_keys() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("env_local.toml");
        let b = dir.path().join("env_test.toml");
        fs::write(&a, "").unwrap();
        fs::write(&b, "").unwrap();
        assert_ne!(project_key(&a), project_key(&b));
    }
}
