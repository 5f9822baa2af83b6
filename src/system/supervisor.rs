// src/system/supervisor.rs

//! The reload state machine.
//!
//! The supervisor owns the active environment and moves it between
//! `Loading`, `Normal` and `Emergency`. File events arrive from the watcher's
//! producer thread; events that land while a shell command runs are held
//! back and replayed as one batch when the command finishes. Reloads are
//! serialized, and user code (hooks, computed leaves) never runs while the
//! state lock is held.

use super::{
    dispatcher::{DispatchError, Dispatcher},
    shell::{ShellAdapter, ShellHandle},
    watcher::{EventKind, FileEvent, FileWatcher, WatchCallback, WatchError, WatchSignal},
};
use crate::{
    core::{
        composer::{self, ComposeError, ComposedEnv},
        magic::MagicKind,
        projector::{self, ProcessEnv, Projector},
        stage::StageFile,
        validator::{self, ValidationErrors},
    },
    dev_utils::BlockTimer,
    models::{IntrospectionState, Settings, WatchKind, WatchRoot},
    reload::{DependencyTracker, PartialReloader, ReloadError},
    script::{ModuleRegistry, ScriptHost},
};
use colored::Colorize;
use serde::Serialize;
use std::{
    fmt,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    time::Duration,
};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Invalid(#[from] ValidationErrors),
    #[error("ReloadTimeout: composing '{}' took longer than {}s", path.display(), timeout.as_secs_f32())]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("The reload worker stopped without a result.")]
    WorkerLost,
    #[error(transparent)]
    Hook(#[from] DispatchError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Reload(#[from] ReloadError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Loading,
    Normal,
    Emergency,
    Destroying,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Loading => "loading",
            Self::Normal => "normal",
            Self::Emergency => "emergency",
            Self::Destroying => "destroying",
        };
        write!(f, "{}", name)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct State {
    mode: Mode,
    env: Option<Arc<ComposedEnv>>,
    projector: Projector,
    process_env: ProcessEnv,
    deferred: Vec<FileEvent>,
    created: bool,
    reload_count: u64,
    last_error: Option<String>,
    last_actions: Vec<String>,
}

pub struct Supervisor {
    stage_file: StageFile,
    settings: Settings,
    /// The environment compositions start from; never overlaid.
    base_env: ProcessEnv,
    /// Script modules of the active environment. Every composition builds
    /// its own registry; it replaces this one only when activated.
    registry: Mutex<Arc<ModuleRegistry>>,
    dispatcher: Arc<Dispatcher>,
    shell: Mutex<ShellHandle>,
    state: Mutex<State>,
    /// Held for the whole of one reload.
    serial: Mutex<()>,
    command_running: Arc<AtomicBool>,
    watcher: Mutex<Option<FileWatcher>>,
    introspection: Option<PathBuf>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("stage_file", &self.stage_file)
            .field("mode", &self.mode())
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        stage_file: StageFile,
        settings: Settings,
        process_env: ProcessEnv,
        dispatcher: Arc<Dispatcher>,
        shell: ShellHandle,
    ) -> Self {
        let registry = Arc::new(ModuleRegistry::new(Arc::new(DependencyTracker::new())));
        Self {
            stage_file,
            settings,
            base_env: process_env.clone(),
            registry: Mutex::new(registry),
            dispatcher,
            shell: Mutex::new(shell),
            state: Mutex::new(State {
                mode: Mode::Loading,
                env: None,
                projector: Projector::new(),
                process_env,
                deferred: Vec::new(),
                created: false,
                reload_count: 0,
                last_error: None,
                last_actions: Vec::new(),
            }),
            serial: Mutex::new(()),
            command_running: Arc::new(AtomicBool::new(false)),
            watcher: Mutex::new(None),
            introspection: None,
        }
    }

    /// Mirrors every state change as JSON into `path`.
    pub fn with_introspection(mut self, path: Option<PathBuf>) -> Self {
        self.introspection = path;
        self
    }

    // --- Introspection ---

    pub fn mode(&self) -> Mode {
        lock(&self.state).mode
    }

    pub fn env(&self) -> Option<Arc<ComposedEnv>> {
        lock(&self.state).env.clone()
    }

    pub fn reload_count(&self) -> u64 {
        lock(&self.state).reload_count
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.state).last_error.clone()
    }

    /// Script modules behind the active environment.
    pub fn registry(&self) -> Arc<ModuleRegistry> {
        Arc::clone(&lock(&self.registry))
    }

    /// The environment children of the session see outside the shell.
    pub fn process_env(&self) -> ProcessEnv {
        lock(&self.state).process_env.clone()
    }

    pub fn snapshot(&self) -> IntrospectionState {
        let state = lock(&self.state);
        IntrospectionState {
            mode: state.mode.to_string(),
            env_name: state.env.as_ref().map(|e| e.name.clone()).unwrap_or_default(),
            stage: self.stage_file.stage.name.clone(),
            prompt: self.prompt_for(state.mode, state.env.as_deref()),
            reload_count: state.reload_count,
            last_error: state.last_error.clone(),
            commands: self.dispatcher.command_names(),
            last_actions: state.last_actions.clone(),
        }
    }

    fn write_introspection(&self) {
        let Some(path) = &self.introspection else {
            return;
        };
        let snapshot = self.snapshot();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let written = serde_json::to_vec_pretty(&snapshot)
            .map_err(std::io::Error::other)
            .and_then(|json| {
                let mut file = NamedTempFile::new_in(dir)?;
                file.write_all(&json)?;
                file.persist(path).map_err(|e| e.error)?;
                Ok(())
            });
        if let Err(e) = written {
            log::warn!("Could not write state file '{}': {}", path.display(), e);
        }
    }

    /// `<mode glyph><stage glyph>(<env name>)$ `
    fn prompt_for(&self, mode: Mode, env: Option<&ComposedEnv>) -> String {
        let glyphs = &self.settings.glyphs;
        let mode_glyph = match mode {
            Mode::Loading => glyphs.loading.as_str(),
            Mode::Emergency => glyphs.emergency.as_str(),
            Mode::Normal | Mode::Destroying => "",
        };
        let stage = &self.stage_file.stage;
        let stage_glyph = glyphs.stages.get(&stage.name).unwrap_or(&stage.glyph);
        let name = env.map(|e| e.name.as_str()).unwrap_or(stage.name.as_str());
        format!("{}{}({})$ ", mode_glyph, stage_glyph, name)
    }

    fn set_mode(&self, mode: Mode) {
        let prompt = {
            let mut state = lock(&self.state);
            state.mode = mode;
            self.prompt_for(mode, state.env.as_deref())
        };
        lock(&self.shell).set_prompt(&prompt);
        self.write_introspection();
    }

    // --- Session wiring ---

    /// Registers the supervisor and the dispatcher on the shell. The
    /// supervisor's `pre_cmd` runs first and its `post_cmd` last, so the
    /// command-running window covers every user hook.
    pub fn attach(self: &Arc<Self>) {
        let mut shell = lock(&self.shell).clone();

        let this = Arc::downgrade(self);
        shell.pre_cmd(Box::new(move |line: &str| -> Result<String, DispatchError> {
            if let Some(this) = this.upgrade() {
                this.command_started();
            }
            Ok(line.to_string())
        }));
        self.dispatcher.install(&mut shell);
        let this = Arc::downgrade(self);
        shell.post_cmd(Box::new(move |_: &str, _: &str, _: &str| -> Result<(), DispatchError> {
            if let Some(this) = this.upgrade() {
                this.command_finished();
            }
            Ok(())
        }));
        let this = Arc::downgrade(self);
        shell.on_exit(Box::new(move || {
            if let Some(this) = this.upgrade() {
                this.shutdown();
            }
        }));
    }

    /// The first load of the session. Never fails: a broken definition
    /// leaves the session in Emergency.
    pub fn load(&self) {
        let _serial = lock(&self.serial);
        self.full_reload(true);
    }

    /// Starts watching the current environment's roots.
    pub fn start_watching(self: &Arc<Self>) -> Result<(), WatchError> {
        let spec = self.env().map(|e| e.watch.clone()).unwrap_or_default();
        let this: Weak<Self> = Arc::downgrade(self);
        let callback: WatchCallback = Arc::new(move |signal| {
            if let Some(this) = this.upgrade() {
                this.on_signal(signal);
            }
        });
        let watcher = FileWatcher::start(
            &spec,
            self.settings.debounce(),
            Arc::clone(&self.command_running),
            callback,
        )?;
        *lock(&self.watcher) = Some(watcher);
        Ok(())
    }

    fn resubscribe(&self, spec: &[WatchRoot]) {
        let watcher = lock(&self.watcher);
        let Some(watcher) = watcher.as_ref() else {
            return;
        };
        if let Err(e) = watcher.resubscribe(spec) {
            log::warn!("Could not update watched roots: {}", e);
        }
    }

    fn with_watcher_paused<T>(&self, f: impl FnOnce() -> T) -> T {
        if let Some(watcher) = lock(&self.watcher).as_ref() {
            watcher.pause();
        }
        let _resume = scopeguard::guard((), |_| {
            if let Some(watcher) = lock(&self.watcher).as_ref() {
                watcher.resume();
            }
        });
        f()
    }

    // --- Events ---

    pub fn on_signal(&self, signal: WatchSignal) {
        match signal {
            WatchSignal::Failed(error) => {
                let _serial = lock(&self.serial);
                self.enter_emergency(error.into());
            }
            WatchSignal::Changes(events) => {
                {
                    let mut state = lock(&self.state);
                    if self.command_running.load(Ordering::SeqCst) {
                        log::debug!(
                            "Deferring {} event(s) until the running command finishes.",
                            events.len()
                        );
                        state.deferred.extend(events);
                        return;
                    }
                }
                self.handle_events(events);
            }
        }
    }

    pub fn command_started(&self) {
        let _state = lock(&self.state);
        self.command_running.store(true, Ordering::SeqCst);
    }

    /// Replays events deferred during the command as a single batch.
    pub fn command_finished(&self) {
        let deferred = {
            let mut state = lock(&self.state);
            self.command_running.store(false, Ordering::SeqCst);
            std::mem::take(&mut state.deferred)
        };
        if !deferred.is_empty() {
            log::debug!("Replaying {} deferred event(s).", deferred.len());
            self.handle_events(deferred);
        }
    }

    /// Reacts to one batch of settled events: any definition change rebuilds
    /// the environment; script module changes are patched in place.
    pub fn handle_events(&self, events: Vec<FileEvent>) {
        let events: Vec<FileEvent> = events.into_iter().filter(|e| !e.during_pause).collect();
        if events.is_empty() {
            return;
        }
        let _serial = lock(&self.serial);
        for event in &events {
            log::debug!("{:?} {}", event.kind, event.path.display());
        }

        let emergency = self.mode() == Mode::Emergency;
        let definitions: Vec<&FileEvent> = events
            .iter()
            .filter(|e| e.root == WatchKind::Definition)
            .collect();
        if emergency || !definitions.is_empty() {
            // User `watch` globs match files outside the layer chain; their
            // content is not part of the hash.
            let layers = self.env().map(|e| e.layers.clone()).unwrap_or_default();
            let extra = definitions.iter().any(|e| !is_layer(&e.path, &layers));
            self.full_reload(emergency || extra);
            return;
        }

        let registry = self.registry();
        let mut modules: Vec<(String, EventKind)> = Vec::new();
        for event in &events {
            let Some(name) = registry.module_name_for(&event.path) else {
                continue;
            };
            match modules.iter_mut().find(|(n, _)| *n == name) {
                Some(entry) => entry.1 = event.kind,
                None => modules.push((name, event.kind)),
            }
        }
        for (name, kind) in modules {
            if self.mode() == Mode::Emergency {
                break;
            }
            self.reload_module(&name, kind);
        }
    }

    // --- Reloads ---

    /// Rebuilds the environment from disk. Unless `force`d, a composition
    /// whose hash matches the active one is a no-op.
    fn full_reload(&self, force: bool) {
        let _timer = BlockTimer::new("full reload");
        let active_hash = {
            let state = lock(&self.state);
            state
                .env
                .as_ref()
                .filter(|_| state.mode == Mode::Normal)
                .map(|e| e.hash.clone())
        };
        let previous_mode = self.mode();
        self.set_mode(Mode::Loading);

        let (env, registry) = match self.compose_bounded() {
            Ok(composed) => composed,
            Err(e) => return self.enter_emergency(e),
        };
        if !force && active_hash.as_deref() == Some(env.hash.as_str()) {
            log::debug!("Composed hash unchanged, nothing to reload.");
            return self.set_mode(previous_mode);
        }
        if let Err(errors) = validator::ensure_valid(&env) {
            return self.enter_emergency(errors.into());
        }
        if let Err(e) = self.activate(env, registry) {
            self.enter_emergency(e);
        }
    }

    /// An empty registry whose scripts run against the session's base
    /// environment, rooted at the project.
    fn fresh_registry(&self) -> Arc<ModuleRegistry> {
        let tracker = Arc::new(DependencyTracker::new());
        tracker.enable(Vec::new());
        let root = self
            .stage_file
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let host = ScriptHost::new(
            self.base_env.to_hash_map(),
            root,
            self.settings.shell.clone(),
            Arc::clone(self.dispatcher.cancellation_token()),
        );
        Arc::new(ModuleRegistry::new(tracker).with_host(host))
    }

    /// Composes into a fresh registry on a worker thread, giving up after the
    /// reload timeout. A timed-out worker finishes on its own registry, which
    /// is then dropped.
    fn compose_bounded(&self) -> Result<(ComposedEnv, Arc<ModuleRegistry>), SupervisorError> {
        let (tx, rx) = mpsc::channel();
        let stage_file = self.stage_file.clone();
        let registry = self.fresh_registry();
        let worker_registry = Arc::clone(&registry);
        let base_env = self.base_env.clone();
        std::thread::Builder::new()
            .name("reload-worker".to_string())
            .spawn(move || {
                tx.send(composer::compose(&stage_file, &worker_registry, &base_env)).ok();
            })
            .map_err(|_| SupervisorError::WorkerLost)?;

        let timeout = self.settings.reload_timeout();
        match rx.recv_timeout(timeout) {
            Ok(result) => Ok((result?, registry)),
            Err(RecvTimeoutError::Timeout) => Err(SupervisorError::Timeout {
                path: self.stage_file.path.clone(),
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(SupervisorError::WorkerLost),
        }
    }

    /// Tears down the active environment and brings up `env`, backed by
    /// `registry`, in its place.
    fn activate(&self, env: ComposedEnv, registry: Arc<ModuleRegistry>) -> Result<(), SupervisorError> {
        let env = Arc::new(env);
        let replacing = self.env().is_some_and(|e| !e.is_emergency());
        if replacing {
            if let Err(e) = self.with_watcher_paused(|| self.dispatcher.run_lifecycle(MagicKind::Onunload)) {
                log::warn!("{}", e);
            }
        }

        *lock(&self.registry) = registry;
        let pairs = projector::project(&env.tree);
        let prompt = {
            let mut state = lock(&self.state);
            let mut shell = lock(&self.shell);
            let State {
                projector, process_env, ..
            } = &mut *state;
            projector.activate(&pairs, process_env, &mut *shell);
            self.dispatcher.register(&env, shell.variables());
            state.env = Some(Arc::clone(&env));
            state.mode = Mode::Normal;
            state.reload_count += 1;
            state.last_error = None;
            let prompt = self.prompt_for(Mode::Normal, Some(&env));
            shell.set_prompt(&prompt);
            prompt
        };
        log::debug!("Prompt is now '{}'.", prompt);
        self.resubscribe(&env.watch);

        let contexts = self.dispatcher.contexts()?;
        lock(&self.shell).set_context(contexts);
        let first = !std::mem::replace(&mut lock(&self.state).created, true);
        self.with_watcher_paused(|| -> Result<(), DispatchError> {
            self.dispatcher.run_lifecycle(MagicKind::Onload)?;
            if first {
                self.dispatcher.run_lifecycle(MagicKind::Oncreate)?;
            }
            self.dispatcher.run_boot_code()
        })?;

        log::info!("Environment '{}' ({}) is active.", env.name, env.stage.name);
        self.write_introspection();
        Ok(())
    }

    /// Loads the placeholder environment. The watcher keeps running so the
    /// next valid edit brings the session back.
    fn enter_emergency(&self, error: SupervisorError) {
        log::warn!("Entering emergency mode: {}", error);
        eprintln!("{}", error.to_string().red());

        let watch = self.env().map(|e| e.watch.clone()).unwrap_or_default();
        let env = Arc::new(composer::emergency_env(&self.stage_file, &self.base_env, watch));
        let pairs = projector::project(&env.tree);
        {
            let mut state = lock(&self.state);
            let mut shell = lock(&self.shell);
            let State {
                projector, process_env, ..
            } = &mut *state;
            projector.activate(&pairs, process_env, &mut *shell);
            self.dispatcher.register(&env, shell.variables());
            shell.set_context(Default::default());
            state.env = Some(Arc::clone(&env));
            state.mode = Mode::Emergency;
            state.last_error = Some(error.to_string());
            shell.set_prompt(&self.prompt_for(Mode::Emergency, Some(&env)));
        }
        self.resubscribe(&env.watch);
        self.write_introspection();
    }

    fn reload_module(&self, name: &str, kind: EventKind) {
        let registry = self.registry();
        if kind == EventKind::Deleted {
            if registry.remove(name).is_some() {
                log::info!("Module '{}' was deleted and unloaded.", name);
            }
            return;
        }

        match PartialReloader::new(registry).run(name) {
            Ok(report) => {
                eprintln!("{}", report.summary().dimmed());
                {
                    let mut state = lock(&self.state);
                    state.last_actions = report.actions;
                    state.reload_count += 1;
                }
                self.reproject();
            }
            Err(ReloadError::NotLoaded(_)) => {
                log::debug!("Module '{}' is not loaded, nothing to patch.", name);
            }
            Err(ReloadError::Partial { module, reason }) => {
                log::warn!(
                    "Partial reload of '{}' failed ({}), reloading the environment.",
                    module,
                    reason
                );
                self.full_reload(true);
            }
            Err(e @ ReloadError::Import { .. }) => self.enter_emergency(e.into()),
        }
    }

    /// Re-reads every leaf after script modules changed underneath it.
    fn reproject(&self) {
        let Some(env) = self.env() else {
            return;
        };
        let pairs = projector::project(&env.tree);
        let mut state = lock(&self.state);
        let mut shell = lock(&self.shell);
        let State {
            projector, process_env, ..
        } = &mut *state;
        projector.activate(&pairs, process_env, &mut *shell);
        self.dispatcher.register(&env, shell.variables());
        drop(shell);
        drop(state);
        self.write_introspection();
    }

    /// Final teardown: `onunload`, then `ondestroy`, then the variables the
    /// session overlaid are restored.
    pub fn shutdown(&self) {
        // Taken out first: stopping the watcher joins a thread that may be
        // waiting on the same lock.
        let watcher = lock(&self.watcher).take();
        drop(watcher);

        let _serial = lock(&self.serial);
        if self.mode() == Mode::Destroying {
            return;
        }
        let had_env = self.env().is_some_and(|e| !e.is_emergency());
        self.set_mode(Mode::Destroying);
        if had_env {
            for kind in [MagicKind::Onunload, MagicKind::Ondestroy] {
                if let Err(e) = self.dispatcher.run_lifecycle(kind) {
                    log::warn!("{}", e);
                }
            }
        }
        {
            let mut state = lock(&self.state);
            let mut shell = lock(&self.shell);
            let State {
                projector, process_env, ..
            } = &mut *state;
            projector.deactivate(process_env, &mut *shell);
        }
        self.write_introspection();
        log::info!("Session ended.");
    }
}

/// Whether `path` is one of the composed definition layers.
fn is_layer(path: &Path, layers: &[PathBuf]) -> bool {
    let canonical = |p: &Path| dunce::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    let path = canonical(path);
    layers.iter().any(|layer| canonical(layer) == path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::EMERGENCY_GLYPH,
        core::{projector::VariableSurface, stage},
    };
    use std::fs;
    use tempfile::{TempDir, tempdir};

    const COMM: &str = r#"
[env]
name = "sandbox"

[vars.port]
type = "int"
value = 8000

[commands.hello]
expr = '"hi"'
"#;

    const REDEFINED: &str = r#"
[env]
name = "sandbox"

[groups.python.vars.version]
type = "str"
value = "3.12"
raw = true

[groups.javascript.vars.version]
type = "str"
value = "22"
raw = true
"#;

    fn project(files: &[(&str, &str)]) -> TempDir {
        let dir = tempdir().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }
        dir
    }

    fn start(dir: &TempDir) -> (Arc<Supervisor>, ShellHandle) {
        start_with(dir, Settings::default())
    }

    fn start_with(dir: &TempDir, settings: Settings) -> (Arc<Supervisor>, ShellHandle) {
        let stage_file = stage::resolve(dir.path(), None).unwrap();
        let process_env = ProcessEnv::from_current();
        let shell = ShellHandle::from_env(&process_env);
        let dispatcher = Arc::new(Dispatcher::new(
            settings.shell.clone(),
            Arc::new(AtomicBool::new(false)),
            false,
        ));
        let supervisor = Arc::new(Supervisor::new(
            stage_file,
            settings,
            process_env,
            dispatcher,
            shell.clone(),
        ));
        supervisor.attach();
        supervisor.load();
        (supervisor, shell)
    }

    fn event(dir: &TempDir, file: &str, root: WatchKind) -> FileEvent {
        FileEvent {
            path: dunce::canonicalize(dir.path()).unwrap().join(file),
            kind: EventKind::Modified,
            root,
            during_pause: false,
            during_command: false,
        }
    }

    #[test]
    fn test_initial_load_projects_and_reaches_normal() {
        let dir = project(&[("env_comm.toml", COMM)]);
        let (supervisor, shell) = start(&dir);

        assert_eq!(supervisor.mode(), Mode::Normal);
        assert_eq!(shell.variable("SANDBOX_PORT").as_deref(), Some("8000"));
        assert_eq!(supervisor.process_env().get("SANDBOX_PORT"), Some("8000"));
        assert_eq!(shell.prompt(), "(sandbox)$ ");
        assert_eq!(supervisor.reload_count(), 1);
        assert_eq!(supervisor.snapshot().commands, vec!["hello"]);
    }

    #[test]
    fn test_redefined_raw_variable_enters_emergency_then_recovers() {
        let dir = project(&[("env_comm.toml", REDEFINED)]);
        let (supervisor, shell) = start(&dir);

        assert_eq!(supervisor.mode(), Mode::Emergency);
        assert!(supervisor.last_error().unwrap().contains("RedefinedVarError(\"VERSION\")"));
        assert!(shell.prompt().starts_with(EMERGENCY_GLYPH));
        assert_eq!(shell.variable("VERSION"), None);

        fs::write(dir.path().join("env_comm.toml"), COMM).unwrap();
        supervisor.handle_events(vec![event(&dir, "env_comm.toml", WatchKind::Definition)]);
        assert_eq!(supervisor.mode(), Mode::Normal);
        assert_eq!(shell.variable("SANDBOX_PORT").as_deref(), Some("8000"));
        assert_eq!(supervisor.last_error(), None);
    }

    #[test]
    fn test_unchanged_definition_is_not_reloaded_again() {
        let dir = project(&[("env_comm.toml", COMM)]);
        let (supervisor, _shell) = start(&dir);
        for _ in 0..3 {
            supervisor.handle_events(vec![event(&dir, "env_comm.toml", WatchKind::Definition)]);
        }
        assert_eq!(supervisor.reload_count(), 1);
        assert_eq!(supervisor.mode(), Mode::Normal);
    }

    #[test]
    fn test_events_during_a_command_coalesce_into_one_reload() {
        let dir = project(&[("env_comm.toml", COMM)]);
        let (supervisor, shell) = start(&dir);

        supervisor.command_started();
        for port in [8001, 8002, 8003] {
            fs::write(dir.path().join("env_comm.toml"), COMM.replace("8000", &port.to_string())).unwrap();
            let mut e = event(&dir, "env_comm.toml", WatchKind::Definition);
            e.during_command = true;
            supervisor.on_signal(WatchSignal::Changes(vec![e]));
        }
        assert_eq!(supervisor.reload_count(), 1);
        assert_eq!(shell.variable("SANDBOX_PORT").as_deref(), Some("8000"));

        supervisor.command_finished();
        assert_eq!(supervisor.reload_count(), 2);
        assert_eq!(supervisor.mode(), Mode::Normal);
        assert_eq!(shell.variable("SANDBOX_PORT").as_deref(), Some("8003"));
        assert_eq!(shell.prompt(), "(sandbox)$ ");
    }

    #[test]
    fn test_events_flagged_during_pause_are_ignored() {
        let dir = project(&[("env_comm.toml", COMM)]);
        let (supervisor, _shell) = start(&dir);
        fs::write(dir.path().join("env_comm.toml"), COMM.replace("8000", "1")).unwrap();
        let mut e = event(&dir, "env_comm.toml", WatchKind::Definition);
        e.during_pause = true;
        supervisor.handle_events(vec![e]);
        assert_eq!(supervisor.reload_count(), 1);
    }

    #[test]
    fn test_source_edit_is_patched_in_place_and_reprojected() {
        let dir = project(&[
            (
                "env_comm.toml",
                r#"
[env]
name = "sandbox"
sources = ["lib"]
imports = ["conf"]

[vars.port]
type = "int"
compute = 'conf.port'
"#,
            ),
            ("lib/conf.stm", "port = 1\n"),
        ]);
        let (supervisor, shell) = start(&dir);
        assert_eq!(shell.variable("SANDBOX_PORT").as_deref(), Some("1"));

        fs::write(dir.path().join("lib/conf.stm"), "port = 2\n").unwrap();
        supervisor.handle_events(vec![event(&dir, "lib/conf.stm", WatchKind::Sources)]);

        assert_eq!(supervisor.mode(), Mode::Normal);
        assert_eq!(shell.variable("SANDBOX_PORT").as_deref(), Some("2"));
        assert!(!supervisor.snapshot().last_actions.is_empty());
    }

    const SOURCED: &str = r#"
[env]
name = "sandbox"
sources = ["lib"]
imports = ["conf"]

[vars.port]
type = "int"
compute = 'conf.port'
"#;

    #[test]
    fn test_source_edit_after_an_unchanged_definition_event_still_applies() {
        let dir = project(&[("env_comm.toml", SOURCED), ("lib/conf.stm", "port = 1\n")]);
        let (supervisor, shell) = start(&dir);
        let active = supervisor.registry();

        // Same content: composed into a scratch registry and discarded.
        supervisor.handle_events(vec![event(&dir, "env_comm.toml", WatchKind::Definition)]);
        assert_eq!(supervisor.reload_count(), 1);
        assert!(Arc::ptr_eq(&active, &supervisor.registry()));

        fs::write(dir.path().join("lib/conf.stm"), "port = 2\n").unwrap();
        supervisor.handle_events(vec![event(&dir, "lib/conf.stm", WatchKind::Sources)]);
        assert_eq!(supervisor.mode(), Mode::Normal);
        assert_eq!(shell.variable("SANDBOX_PORT").as_deref(), Some("2"));
        assert_eq!(supervisor.reload_count(), 2);
    }

    #[test]
    fn test_full_reload_swaps_in_a_new_registry() {
        let dir = project(&[("env_comm.toml", SOURCED), ("lib/conf.stm", "port = 1\n")]);
        let (supervisor, shell) = start(&dir);
        let before = supervisor.registry();

        fs::write(dir.path().join("env_comm.toml"), format!("{}\n# edited\n", SOURCED)).unwrap();
        supervisor.handle_events(vec![event(&dir, "env_comm.toml", WatchKind::Definition)]);
        let after = supervisor.registry();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.get("conf").is_some());

        fs::write(dir.path().join("lib/conf.stm"), "port = 5\n").unwrap();
        supervisor.handle_events(vec![event(&dir, "lib/conf.stm", WatchKind::Sources)]);
        assert_eq!(shell.variable("SANDBOX_PORT").as_deref(), Some("5"));
    }

    #[test]
    fn test_deleted_source_module_is_unloaded() {
        let dir = project(&[("env_comm.toml", SOURCED), ("lib/conf.stm", "port = 1\n")]);
        let (supervisor, shell) = start(&dir);
        assert!(supervisor.registry().get("conf").is_some());

        fs::remove_file(dir.path().join("lib/conf.stm")).unwrap();
        let mut deleted = event(&dir, "lib/conf.stm", WatchKind::Sources);
        deleted.kind = EventKind::Deleted;
        supervisor.handle_events(vec![deleted]);

        assert_eq!(supervisor.mode(), Mode::Normal);
        assert!(supervisor.registry().get("conf").is_none());
        assert!(supervisor.registry().names().is_empty());
        // Objects already bound into the environment stay usable.
        assert_eq!(shell.variable("SANDBOX_PORT").as_deref(), Some("1"));
    }

    #[test]
    fn test_failed_partial_reload_falls_back_to_a_full_reload() {
        let dir = project(&[
            (
                "env_comm.toml",
                r#"
[env]
name = "sandbox"
sources = ["lib"]
imports = ["conf"]

[vars.limit]
type = "int"
compute = 'conf.limit'
"#,
            ),
            ("lib/base.stm", "n = 1\n"),
            ("lib/conf.stm", "from base import n\nlimit = 100 % n\n"),
        ]);
        let (supervisor, shell) = start(&dir);
        assert_eq!(shell.variable("SANDBOX_LIMIT").as_deref(), Some("0"));

        // `base` patches cleanly; re-running its dependent `conf` fails.
        fs::write(dir.path().join("lib/base.stm"), "n = 0\n").unwrap();
        supervisor.handle_events(vec![event(&dir, "lib/base.stm", WatchKind::Sources)]);
        assert_eq!(supervisor.mode(), Mode::Emergency);
        assert!(supervisor.last_error().unwrap().contains("[env.imports]"));

        fs::write(dir.path().join("lib/base.stm"), "n = 3\n").unwrap();
        supervisor.handle_events(vec![event(&dir, "lib/base.stm", WatchKind::Sources)]);
        assert_eq!(supervisor.mode(), Mode::Normal);
        assert_eq!(shell.variable("SANDBOX_LIMIT").as_deref(), Some("1"));
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_composition_times_out_into_emergency() {
        let slow = r#"
[env]
name = "sandbox"

[vars.slow]
type = "str"
default_factory = 'sh("sleep 3")'
"#;
        let dir = project(&[("env_comm.toml", slow)]);
        let settings = Settings {
            reload_timeout_secs: 1,
            ..Settings::default()
        };
        let (supervisor, shell) = start_with(&dir, settings);
        assert_eq!(supervisor.mode(), Mode::Emergency);
        assert!(supervisor.last_error().unwrap().starts_with("ReloadTimeout"));
        assert!(shell.prompt().starts_with(EMERGENCY_GLYPH));

        fs::write(dir.path().join("env_comm.toml"), COMM).unwrap();
        supervisor.handle_events(vec![event(&dir, "env_comm.toml", WatchKind::Definition)]);
        assert_eq!(supervisor.mode(), Mode::Normal);
        assert_eq!(shell.variable("SANDBOX_PORT").as_deref(), Some("8000"));
    }

    #[cfg(unix)]
    #[test]
    fn test_user_watched_file_forces_a_reload() {
        let dir = project(&[
            (
                "env_comm.toml",
                r#"
[env]
name = "sandbox"
watch = ["config/*.txt"]

[vars.motd]
type = "str"
default_factory = 'sh("cat config/motd.txt")'
"#,
            ),
            ("config/motd.txt", "hello\n"),
        ]);
        let (supervisor, shell) = start(&dir);
        assert_eq!(shell.variable("SANDBOX_MOTD").as_deref(), Some("hello"));
        let env = supervisor.env().unwrap();
        assert!(env.watch.iter().any(|w| w.include.iter().any(|g| g == "config/*.txt")));

        fs::write(dir.path().join("config/motd.txt"), "bye\n").unwrap();
        supervisor.handle_events(vec![event(&dir, "config/motd.txt", WatchKind::Definition)]);
        assert_eq!(supervisor.reload_count(), 2);
        assert_eq!(shell.variable("SANDBOX_MOTD").as_deref(), Some("bye"));
    }

    #[test]
    fn test_broken_source_edit_enters_emergency_until_fixed() {
        let dir = project(&[
            (
                "env_comm.toml",
                "[env]\nname = \"sandbox\"\nsources = [\"lib\"]\nimports = [\"conf\"]\n",
            ),
            ("lib/conf.stm", "port = 1\n"),
        ]);
        let (supervisor, _shell) = start(&dir);

        fs::write(dir.path().join("lib/conf.stm"), "port = 1 /\n").unwrap();
        supervisor.handle_events(vec![event(&dir, "lib/conf.stm", WatchKind::Sources)]);
        assert_eq!(supervisor.mode(), Mode::Emergency);

        fs::write(dir.path().join("lib/conf.stm"), "port = 3\n").unwrap();
        supervisor.handle_events(vec![event(&dir, "lib/conf.stm", WatchKind::Sources)]);
        assert_eq!(supervisor.mode(), Mode::Normal);
    }

    #[cfg(unix)]
    #[test]
    fn test_lifecycle_hooks_run_in_order() {
        let hooks = r#"
[env]
name = "sandbox"

[hooks.load]
kind = "onload"
run = "echo onload >> '{root}/events.log'"

[hooks.create]
kind = "oncreate"
run = "echo oncreate >> '{root}/events.log'"

[hooks.unload]
kind = "onunload"
run = "echo onunload >> '{root}/events.log'"

[hooks.destroy]
kind = "ondestroy"
run = "echo ondestroy >> '{root}/events.log'"
"#;
        let dir = project(&[("env_comm.toml", hooks)]);
        let (supervisor, _shell) = start(&dir);
        let log = || fs::read_to_string(dir.path().join("events.log")).unwrap_or_default();
        assert_eq!(log(), "onload\noncreate\n");

        fs::write(dir.path().join("env_comm.toml"), format!("{}\n# edited\n", hooks)).unwrap();
        supervisor.handle_events(vec![event(&dir, "env_comm.toml", WatchKind::Definition)]);
        assert_eq!(log(), "onload\noncreate\nonunload\nonload\n");

        supervisor.shutdown();
        assert_eq!(log(), "onload\noncreate\nonunload\nonload\nonunload\nondestroy\n");
        assert_eq!(supervisor.mode(), Mode::Destroying);
    }

    #[test]
    fn test_shutdown_restores_the_shell_variables() {
        let dir = project(&[("env_comm.toml", COMM)]);
        let (supervisor, shell) = start(&dir);
        let before_path = ProcessEnv::from_current().get("PATH").map(str::to_string);

        assert!(shell.variable("SANDBOX_PORT").is_some());
        supervisor.shutdown();
        assert_eq!(shell.variable("SANDBOX_PORT"), None);
        assert_eq!(shell.variable("PATH"), before_path);
    }

    #[test]
    fn test_state_file_mirrors_transitions() {
        let dir = project(&[("env_comm.toml", COMM)]);
        let state_file = dir.path().join("state.json");
        let stage_file = stage::resolve(dir.path(), None).unwrap();
        let settings = Settings::default();
        let process_env = ProcessEnv::from_current();
        let token = Arc::new(AtomicBool::new(false));
        let dispatcher = Arc::new(Dispatcher::new(settings.shell.clone(), token, false));
        let supervisor = Supervisor::new(
            stage_file,
            settings,
            process_env.clone(),
            dispatcher,
            ShellHandle::from_env(&process_env),
        )
        .with_introspection(Some(state_file.clone()));
        supervisor.load();

        let json = fs::read_to_string(&state_file).unwrap();
        let state: IntrospectionState = serde_json::from_str(&json).unwrap();
        assert_eq!(state.mode, "normal");
        assert_eq!(state.env_name, "sandbox");
        assert_eq!(state.stage, "comm");
        assert_eq!(state.reload_count, 1);
        assert_eq!(state.commands, vec!["hello"]);
    }
}
