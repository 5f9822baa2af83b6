// src/cli/handlers/commons.rs

// Shared steps of the launcher actions: finding the definition, composing it
// for one-off output, and bringing up a supervised session.

use anyhow::{Context, Result};
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    CancellationToken,
    constants::{ENV_DEBUG, ENV_TEST_INTROSPECT, ENV_TEST_STATE_FILE},
    core::{
        composer::{self, ComposedEnv},
        projector::{self, ProcessEnv},
        stage::{self, StageFile},
        validator,
    },
    models::Settings,
    reload::DependencyTracker,
    script::{ModuleRegistry, ScriptHost},
    system::{dispatcher::Dispatcher, shell::ShellHandle, supervisor::Supervisor},
};

/// Resolves the definition file for `stage`, searching from the working directory.
pub fn resolve_stage_file(stage: Option<&str>) -> Result<StageFile> {
    let cwd = env::current_dir().context("Could not read the current directory")?;
    let stage_file = stage::resolve(&cwd, stage)?;
    log::debug!(
        "Resolved stage '{}' to '{}'.",
        stage_file.stage.name,
        stage_file.path.display()
    );
    Ok(stage_file)
}

/// Composes and validates the environment of `stage_file` without a session:
/// no hooks run and nothing is watched. Validation errors are listed one per
/// line in the returned error.
pub fn compose_checked(stage_file: &StageFile) -> Result<(ComposedEnv, Vec<(String, String)>)> {
    let process_env = ProcessEnv::from_current();
    let host = ScriptHost {
        env: process_env.to_hash_map(),
        cwd: stage_file.path.parent().map(Path::to_path_buf).unwrap_or_default(),
        ..ScriptHost::from_process()
    };
    let registry = ModuleRegistry::new(Arc::new(DependencyTracker::new())).with_host(host);
    let env = composer::compose(stage_file, &registry, &process_env)
        .with_context(|| format!("Could not compose '{}'", stage_file.path.display()))?;
    validator::ensure_valid(&env)?;
    let pairs = projector::project(&env.tree);
    Ok((env, pairs))
}

pub fn is_debug() -> bool {
    env::var(ENV_DEBUG).is_ok_and(|v| !v.is_empty() && v != "0")
}

/// The JSON state file, when the introspection channel is switched on.
pub fn introspection_path() -> Option<PathBuf> {
    env::var(ENV_TEST_INTROSPECT).ok().filter(|v| !v.is_empty())?;
    env::var_os(ENV_TEST_STATE_FILE).map(PathBuf::from)
}

/// A loaded, supervised environment and the shell surface it projects onto.
#[derive(Debug)]
pub struct Session {
    pub supervisor: Arc<Supervisor>,
    pub handle: ShellHandle,
}

/// Builds the supervisor for `stage_file`, wires it into a fresh shell
/// surface and performs the first load. A broken definition still yields a
/// session, in Emergency mode.
pub fn start_session(
    stage_file: StageFile,
    settings: &Settings,
    process_env: ProcessEnv,
    cancellation_token: &CancellationToken,
) -> Session {
    let handle = ShellHandle::from_env(&process_env);
    let dispatcher = Arc::new(Dispatcher::new(
        settings.shell.clone(),
        Arc::clone(cancellation_token),
        is_debug(),
    ));
    let supervisor = Arc::new(
        Supervisor::new(stage_file, settings.clone(), process_env, dispatcher, handle.clone())
            .with_introspection(introspection_path()),
    );
    supervisor.attach();
    supervisor.load();
    Session { supervisor, handle }
}

