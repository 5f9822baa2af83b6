// src/core/settings.rs

use crate::{
    constants::{DEFAULT_DEBOUNCE_MS, DEFAULT_RELOAD_TIMEOUT_SECS, EMERGENCY_GLYPH, LOADING_GLYPH},
    core::paths::{self, PathError},
    models::{GlyphSettings, Settings, ShellSettings},
};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Could not access settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize default settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            reload_timeout_secs: DEFAULT_RELOAD_TIMEOUT_SECS,
            glyphs: GlyphSettings {
                loading: LOADING_GLYPH.to_string(),
                emergency: EMERGENCY_GLYPH.to_string(),
                stages: Default::default(),
            },
        }
    }
}

impl Settings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }
}

/// Loads `settings.toml` from the config dir, writing the defaults first if
/// the file does not exist yet.
pub fn load_settings() -> Result<Settings, SettingsError> {
    let path = paths::get_settings_path()?;
    load_settings_from(&path)
}

pub fn load_settings_from(path: &Path) -> Result<Settings, SettingsError> {
    if !path.exists() {
        let defaults = Settings::default();
        let toml_string = toml::to_string_pretty(&defaults)?;
        fs::write(path, toml_string)?;
        log::debug!("Default settings written to '{}'.", path.display());
        Ok(defaults)
    } else {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

fn default_shell() -> ShellSettings {
    if cfg!(target_os = "windows") {
        return ShellSettings {
            path: PathBuf::from("cmd.exe"),
            args: vec!["/C".to_string()],
        };
    }
    let path = ["bash", "sh"]
        .into_iter()
        .find(|name| is_executable_in_path(name))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/bin/sh"));
    ShellSettings {
        path,
        args: vec!["-c".to_string()],
    }
}

fn is_executable_in_path(executable_name: &str) -> bool {
    if let Ok(path_var) = env::var("PATH") {
        for path in env::split_paths(&path_var) {
            if path.join(executable_name).is_file() {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_written_then_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");

        let first = load_settings_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(first.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert_eq!(first.reload_timeout(), Duration::from_secs(DEFAULT_RELOAD_TIMEOUT_SECS));

        let second = load_settings_from(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_user_overrides_are_respected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(
            &path,
            r#"
debounce_ms = 50
reload_timeout_secs = 3

[shell]
path = "/bin/zsh"
args = ["-c"]

[glyphs]
loading = "..."
emergency = "!!"

[glyphs.stages]
local = "L"
"#,
        )
        .unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.debounce(), Duration::from_millis(50));
        assert_eq!(settings.shell.path, PathBuf::from("/bin/zsh"));
        assert_eq!(settings.glyphs.stages.get("local").map(String::as_str), Some("L"));
    }

    #[test]
    fn test_invalid_settings_fail_to_parse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "debounce_ms = \"soon\"").unwrap();
        assert!(matches!(load_settings_from(&path), Err(SettingsError::Parse(_))));
    }
}
