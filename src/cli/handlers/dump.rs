// src/cli/handlers/dump.rs

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;

use super::commons;
use crate::{
    CancellationToken,
    constants::DUMP_PREFIX,
    core::{projector, stage::StageFile},
};

/// Writes `.env_<stage>` next to the selected definition file.
pub fn handle(
    stage: Option<String>,
    _args: Vec<String>,
    _cancellation_token: &CancellationToken,
) -> Result<i32> {
    let stage_file = commons::resolve_stage_file(stage.as_deref())?;
    let path = dump(&stage_file)?;
    println!("{} {}", "Wrote".green(), path.display());
    Ok(0)
}

pub fn dump(stage_file: &StageFile) -> Result<PathBuf> {
    let (env, pairs) = commons::compose_checked(stage_file)?;
    let path = env.root.join(format!("{}{}", DUMP_PREFIX, env.stage.name));
    projector::write_dump(&path, &pairs).with_context(|| format!("Could not write '{}'", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_dump_writes_dotenv_next_to_the_definition() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("env_comm.toml"), "[env]\nname = \"app\"\n").unwrap();
        fs::write(
            dir.path().join("env_ci.toml"),
            "[vars.runner]\ntype = \"str\"\nvalue = \"linux\"\n",
        )
        .unwrap();
        let stage_file = stage::resolve(dir.path(), Some("ci")).unwrap();

        let path = dump(&stage_file).unwrap();
        assert_eq!(path.file_name().unwrap(), ".env_ci");
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.lines().any(|l| l == "APP_RUNNER=\"linux\""));
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn test_value_with_quotes_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("env_comm.toml"),
            "[env]\nname = \"app\"\n[vars.motto]\ntype = \"str\"\nvalue = 'say \"hi\"'\n",
        )
        .unwrap();
        let stage_file = stage::resolve(dir.path(), None).unwrap();
        assert!(dump(&stage_file).is_err());
        assert!(!dir.path().join(".env_comm").exists());
    }
}
