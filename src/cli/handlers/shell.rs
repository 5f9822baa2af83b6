// src/cli/handlers/shell.rs

use anyhow::{Context, Result, bail};
use colored::Colorize;
use std::{env, io};
use uuid::Uuid;

use super::commons::{self, Session};
use crate::{
    CancellationToken,
    constants::ENV_SESSION,
    core::{
        paths,
        projector::{ProcessEnv, VariableSurface},
        settings,
    },
    system::{shell::LineShell, supervisor::Mode},
};

/// `[stage]` with no action: an interactive, live-reloading session.
pub fn handle(
    stage: Option<String>,
    _args: Vec<String>,
    cancellation_token: &CancellationToken,
) -> Result<i32> {
    if let Ok(session) = env::var(ENV_SESSION) {
        bail!(
            "Already inside a session ({}). Exit it before starting another one.",
            session
        );
    }

    let stage_file = commons::resolve_stage_file(stage.as_deref())?;
    let settings = settings::load_settings().context("Could not load settings")?;
    let cwd = env::current_dir().context("Could not read the current directory")?;
    let history = paths::get_history_path(&stage_file.path)?;

    let mut process_env = ProcessEnv::from_current();
    let session_id = Uuid::new_v4();
    process_env.set_variable(ENV_SESSION, &session_id.to_string());
    log::debug!("Starting session {} for '{}'.", session_id, stage_file.path.display());

    let Session { supervisor, handle } =
        commons::start_session(stage_file, &settings, process_env, cancellation_token);
    if let Err(e) = supervisor.start_watching() {
        log::warn!("File watching is disabled for this session: {}", e);
        eprintln!("{}", "Warning: edits will not be picked up until the session restarts.".yellow());
    }
    if supervisor.mode() == Mode::Emergency {
        eprintln!("{}", "Fix the definition file and save it to recover.".yellow());
    }

    let mut shell = LineShell::new(handle, settings.shell.clone(), cwd, cancellation_token.clone())
        .with_history(history);
    let status = shell.run_interactive(io::stdin().lock())?;
    Ok(status)
}
