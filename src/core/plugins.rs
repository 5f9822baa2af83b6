// src/core/plugins.rs

use super::loader::{self, DefinitionLayer, LoadError};
use crate::{constants::DEFINITION_EXTENSION, models::DefinitionFile};
use std::path::{Path, PathBuf};

const VIRTUALENV: &str = r#"
[env]
path_prepend = [".venv/bin"]

[groups.venv.vars.dir]
type = "path"
default = ".venv"

[groups.venv.vars.virtual_env]
type = "path"
raw = true
default = ".venv"
"#;

/// Built-in plugin layers, by name.
const BUILTIN_PLUGINS: &[(&str, &str)] = &[("virtualenv", VIRTUALENV)];

pub fn builtin_names() -> Vec<&'static str> {
    BUILTIN_PLUGINS.iter().map(|(name, _)| *name).collect()
}

/// Resolves a plugin declared by `declaring`.
///
/// A name ending in `.toml` is a layer file relative to the declaring layer;
/// anything else must be a built-in plugin. Built-in layers are anchored at
/// the declaring layer's directory. Plugin layers never pull in parents.
pub fn resolve_plugin(spec: &str, declaring: &DefinitionLayer) -> Result<DefinitionLayer, LoadError> {
    let is_file = Path::new(spec)
        .extension()
        .is_some_and(|ext| ext == DEFINITION_EXTENSION);
    if is_file {
        return loader::load_layer(&declaring.resolve(spec));
    }

    let (name, source) = BUILTIN_PLUGINS
        .iter()
        .find(|(name, _)| *name == spec)
        .ok_or_else(|| LoadError::UnknownPlugin {
            path: declaring.path.clone(),
            plugin: spec.to_string(),
        })?;

    let path = PathBuf::from(format!("<plugin:{}>", name));
    let file: DefinitionFile = toml::from_str(source).map_err(|e| LoadError::DefinitionImport {
        path: path.clone(),
        source: Box::new(e),
    })?;

    Ok(DefinitionLayer {
        content_hash: super::cache::content_hash(source.as_bytes()),
        path,
        root: declaring.root.clone(),
        stage: None,
        file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn declaring(dir: &Path) -> DefinitionLayer {
        let path = dir.join("env_comm.toml");
        fs::write(&path, "").unwrap();
        loader::load_layer(&path).unwrap()
    }

    #[test]
    fn test_virtualenv_is_builtin() {
        let dir = tempdir().unwrap();
        let layer = resolve_plugin("virtualenv", &declaring(dir.path())).unwrap();
        assert!(layer.file.groups.contains_key("venv"));
        assert_eq!(layer.file.env.path_prepend, vec![".venv/bin"]);
        assert_eq!(layer.root, dunce::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn test_plugin_file_is_loaded_relative_to_declaring_layer() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("plugins")).unwrap();
        fs::write(
            dir.path().join("plugins/docker.toml"),
            "[vars.docker_host]\ntype = \"str\"\nvalue = \"unix:///var/run/docker.sock\"\n",
        )
        .unwrap();
        let layer = resolve_plugin("plugins/docker.toml", &declaring(dir.path())).unwrap();
        assert!(layer.file.vars.contains_key("docker_host"));
    }

    #[test]
    fn test_unknown_plugin_is_an_error() {
        let dir = tempdir().unwrap();
        let err = resolve_plugin("conda", &declaring(dir.path())).unwrap_err();
        assert!(matches!(err, LoadError::UnknownPlugin { plugin, .. } if plugin == "conda"));
        assert_eq!(builtin_names(), vec!["virtualenv"]);
    }
}
