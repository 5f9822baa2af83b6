// src/cli/handlers/dry_run.rs

use anyhow::Result;

use super::commons;
use crate::{
    CancellationToken,
    core::{projector, stage::StageFile},
};

/// Prints the projected variables as `export KEY="value"` lines.
pub fn handle(
    stage: Option<String>,
    _args: Vec<String>,
    _cancellation_token: &CancellationToken,
) -> Result<i32> {
    let stage_file = commons::resolve_stage_file(stage.as_deref())?;
    print!("{}", exports(&stage_file)?);
    Ok(0)
}

pub fn exports(stage_file: &StageFile) -> Result<String> {
    let (_, pairs) = commons::compose_checked(stage_file)?;
    Ok(projector::format_exports(&pairs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_exports_list_every_leaf() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("env_comm.toml"),
            "[env]\nname = \"app\"\n[vars.port]\ntype = \"int\"\nvalue = 8000\n",
        )
        .unwrap();
        let stage_file = stage::resolve(dir.path(), None).unwrap();
        let out = exports(&stage_file).unwrap();
        assert!(out.lines().any(|l| l == "export APP_PORT=\"8000\""));
        assert!(out.lines().any(|l| l == "export APP_STAGE=\"comm\""));
        assert!(out.lines().any(|l| l.starts_with("export PATH=")));
    }

    #[test]
    fn test_invalid_environment_lists_its_errors() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("env_comm.toml"),
            "[vars.port]\ntype = \"int\"\nvalue = \"eighty\"\n[vars.host]\ntype = \"str\"\n",
        )
        .unwrap();
        let stage_file = stage::resolve(dir.path(), None).unwrap();
        let message = exports(&stage_file).unwrap_err().to_string();
        assert!(message.contains("2 error(s)"), "{}", message);
    }
}
