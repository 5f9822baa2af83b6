// src/cli/handlers/run.rs

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::{env, path::PathBuf};

use super::commons::{self, Session};
use crate::{
    CancellationToken,
    cli::args::{InlineArgs, RunArgs},
    core::{projector::ProcessEnv, settings, stage::StageFile},
    models::Settings,
    system::{shell::LineShell, supervisor::Mode},
};

/// `[stage] run <cmd...>`: the words are re-quoted into one line.
pub fn handle(
    stage: Option<String>,
    args: Vec<String>,
    cancellation_token: &CancellationToken,
) -> Result<i32> {
    let run_args = RunArgs::try_parse_from(&args)?;
    let line = shlex::try_join(run_args.command.iter().map(String::as_str))
        .map_err(|e| anyhow!("Command cannot be quoted for the shell: {}", e))?;
    run_line(stage, &line, cancellation_token)
}

/// `[stage] -c <cmd>`: the line is used as written.
pub fn handle_inline(
    stage: Option<String>,
    args: Vec<String>,
    cancellation_token: &CancellationToken,
) -> Result<i32> {
    let inline_args = InlineArgs::try_parse_from(&args)?;
    run_line(stage, &inline_args.command, cancellation_token)
}

fn run_line(stage: Option<String>, line: &str, cancellation_token: &CancellationToken) -> Result<i32> {
    let stage_file = commons::resolve_stage_file(stage.as_deref())?;
    let settings = settings::load_settings().context("Could not load settings")?;
    let cwd = env::current_dir().context("Could not read the current directory")?;
    run_once(stage_file, &settings, line, cwd, cancellation_token)
}

/// Runs one line under a supervised environment, with project commands and
/// hooks in effect, then tears the environment down. Returns the line's
/// exit code.
pub fn run_once(
    stage_file: StageFile,
    settings: &Settings,
    line: &str,
    cwd: PathBuf,
    cancellation_token: &CancellationToken,
) -> Result<i32> {
    let Session { supervisor, handle } =
        commons::start_session(stage_file, settings, ProcessEnv::from_current(), cancellation_token);
    if supervisor.mode() == Mode::Emergency {
        let error = supervisor.last_error().unwrap_or_default();
        supervisor.shutdown();
        return Err(anyhow!(error));
    }

    let mut shell = LineShell::new(handle.clone(), settings.shell.clone(), cwd, cancellation_token.clone());
    let code = shell.execute_line(line);
    handle.fire_exit();
    Ok(code)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::stage;
    use std::{
        fs,
        sync::{Arc, atomic::AtomicBool},
    };
    use tempfile::tempdir;

    const DEFINITION: &str = r#"
[env]
name = "app"

[vars.port]
type = "int"
value = 8000

[commands.report]
params = ["code"]
run = "echo $APP_PORT > '{root}/port.txt'; exit {code}"

[hooks.last]
kind = "ondestroy"
run = "echo bye > '{root}/destroyed.txt'"
"#;

    fn setup() -> (tempfile::TempDir, StageFile) {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("env_comm.toml"), DEFINITION).unwrap();
        let stage_file = stage::resolve(dir.path(), None).unwrap();
        (dir, stage_file)
    }

    #[test]
    fn test_project_command_runs_with_the_environment_and_propagates_its_code() {
        let (dir, stage_file) = setup();
        let token = Arc::new(AtomicBool::new(false));
        let cwd = dir.path().to_path_buf();
        let code = run_once(stage_file, &Settings::default(), "report 3", cwd, &token).unwrap();

        assert_eq!(code, 3);
        assert_eq!(fs::read_to_string(dir.path().join("port.txt")).unwrap(), "8000\n");
        assert_eq!(fs::read_to_string(dir.path().join("destroyed.txt")).unwrap(), "bye\n");
    }

    #[test]
    fn test_plain_line_goes_through_the_system_shell() {
        let (dir, stage_file) = setup();
        let token = Arc::new(AtomicBool::new(false));
        let code = run_once(
            stage_file,
            &Settings::default(),
            "test \"$APP_PORT\" = 8000 && exit 7",
            dir.path().to_path_buf(),
            &token,
        )
        .unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn test_broken_definition_fails_before_running() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("env_comm.toml"), "[vars.x]\ntype = \"int\"\nvalue = \"no\"\n").unwrap();
        let stage_file = stage::resolve(dir.path(), None).unwrap();
        let token = Arc::new(AtomicBool::new(false));
        let cwd = dir.path().to_path_buf();
        let err = run_once(stage_file, &Settings::default(), "exit 0", cwd, &token).unwrap_err();
        assert!(err.to_string().contains("error(s)"), "{}", err);
    }
}
