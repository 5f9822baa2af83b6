// src/cli/handlers/init.rs

use anyhow::{Context, Result, bail};
use clap::Parser;
use colored::Colorize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::{
    CancellationToken,
    cli::args::InitArgs,
    constants::{COMM_STAGE, DEFAULT_INIT_STAGE},
    core::stage,
};

const COMM_TEMPLATE: &str = r#"# Shared baseline. Every stage in this directory inherits it.
[env]
path_prepend = ["bin"]

[vars.log_level]
type = "str"
default = "info"

[commands.where]
expr = 'root'
"#;

fn stage_template(stage: &str) -> String {
    format!(
        r#"# Overrides for the '{}' stage. env_comm.toml is inherited.
[env]

[vars.log_level]
value = "debug"
"#,
        stage
    )
}

/// The main handler for the `init` command.
pub fn handle(
    _stage: Option<String>,
    args: Vec<String>,
    _cancellation_token: &CancellationToken,
) -> Result<i32> {
    let init_args = InitArgs::try_parse_from(&args)?;
    let stage = target_stage(&init_args);

    let target_dir = env::current_dir().context("Could not read the current directory")?;
    println!("Initializing definitions in: {}", target_dir.display());

    for path in scaffold(&target_dir, stage)? {
        println!("  {} {}", "created".green(), path.display());
    }
    Ok(0)
}

fn target_stage(init_args: &InitArgs) -> &str {
    init_args.stage.as_deref().unwrap_or(DEFAULT_INIT_STAGE)
}

/// Writes `env_comm.toml` and, for any other stage, `env_<stage>.toml`.
/// Nothing is written if any of them already exists.
pub fn scaffold(dir: &Path, stage: &str) -> Result<Vec<PathBuf>> {
    if stage.is_empty() || stage.contains(['/', '\\', '.']) || stage.contains(char::is_whitespace) {
        bail!("'{}' is not a valid stage name.", stage);
    }

    let mut files = vec![(dir.join(stage::definition_file_name(COMM_STAGE)), COMM_TEMPLATE.to_string())];
    if stage != COMM_STAGE {
        files.push((dir.join(stage::definition_file_name(stage)), stage_template(stage)));
    }

    if let Some((existing, _)) = files.iter().find(|(path, _)| path.exists()) {
        bail!("ErrFileExists: '{}' already exists.", existing.display());
    }

    let mut written = Vec::with_capacity(files.len());
    for (path, content) in files {
        fs::write(&path, content).with_context(|| format!("Could not write '{}'", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::handlers::commons;
    use tempfile::tempdir;

    #[test]
    fn test_scaffold_writes_a_pair_that_composes() {
        let dir = tempdir().unwrap();
        let written = scaffold(dir.path(), "local").unwrap();
        assert_eq!(written.len(), 2);
        assert!(dir.path().join("env_comm.toml").is_file());
        assert!(dir.path().join("env_local.toml").is_file());

        let stage_file = stage::resolve(dir.path(), None).unwrap();
        assert_eq!(stage_file.stage.name, "local");
        let (env, pairs) = commons::compose_checked(&stage_file).unwrap();
        assert!(env.magic.command("where").is_some());
        let prefix = env.name.to_uppercase().replace(|c: char| !c.is_ascii_alphanumeric(), "_");
        let key = format!("{}_LOG_LEVEL", prefix);
        assert!(pairs.contains(&(key, "debug".to_string())));
    }

    #[test]
    fn test_scaffold_comm_only() {
        let dir = tempdir().unwrap();
        let written = scaffold(dir.path(), "comm").unwrap();
        assert_eq!(written, vec![dir.path().join("env_comm.toml")]);
    }

    #[test]
    fn test_default_stage_is_comm() {
        let none = InitArgs::try_parse_from(Vec::<String>::new()).unwrap();
        assert_eq!(target_stage(&none), "comm");
        let ci = InitArgs::try_parse_from(["ci"]).unwrap();
        assert_eq!(target_stage(&ci), "ci");

        let dir = tempdir().unwrap();
        let written = scaffold(dir.path(), target_stage(&none)).unwrap();
        assert_eq!(written, vec![dir.path().join("env_comm.toml")]);
        let stage_file = stage::resolve(dir.path(), None).unwrap();
        assert_eq!(stage_file.stage.name, "comm");
        assert!(commons::compose_checked(&stage_file).is_ok());
    }

    #[test]
    fn test_existing_file_is_never_overwritten() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("env_local.toml"), "# mine\n").unwrap();
        let err = scaffold(dir.path(), "local").unwrap_err();
        assert!(err.to_string().starts_with("ErrFileExists"));
        assert!(!dir.path().join("env_comm.toml").exists());
        assert_eq!(fs::read_to_string(dir.path().join("env_local.toml")).unwrap(), "# mine\n");
    }

    #[test]
    fn test_invalid_stage_name() {
        let dir = tempdir().unwrap();
        assert!(scaffold(dir.path(), "../x").is_err());
        assert!(scaffold(dir.path(), "").is_err());
    }
}
