// src/system/shell.rs

//! The shell host: a narrow adapter trait and a line-oriented implementation.
//!
//! The core only ever talks to a shell through [`ShellAdapter`]: variables,
//! prompt, context, and the hook points around each command. [`LineShell`]
//! reads lines from an input, runs project commands in process through the
//! registered runner, and sends every other line to the system shell with
//! both output pipes streamed through the hooks.

use super::{
    dispatcher::DispatchError,
    executor::{self, Stream},
};
use crate::{CancellationToken, core::projector::{ProcessEnv, VariableSurface}, models::ShellSettings};
use colored::Colorize;
use std::{
    collections::{BTreeMap, HashMap},
    fs::OpenOptions,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

pub type PreCmdFn = Box<dyn FnMut(&str) -> Result<String, DispatchError> + Send>;
pub type StreamFn = Box<dyn FnMut(&str, String) -> Result<String, DispatchError> + Send>;
pub type PostCmdFn = Box<dyn FnMut(&str, &str, &str) -> Result<(), DispatchError> + Send>;
pub type ExitFn = Box<dyn FnOnce() + Send>;
/// Runs a line in process. `None` hands the line to the system shell.
pub type RunnerFn = Box<dyn FnMut(&str, &mut CommandIo) -> Option<Result<i32, DispatchError>> + Send>;

/// What an in-process command may touch while it runs.
pub struct CommandIo<'a> {
    pub cwd: &'a mut PathBuf,
    pub env: &'a HashMap<String, String>,
    /// Output of the command, one line per call, trailing newline included.
    pub emit: &'a mut dyn FnMut(Stream, String),
}

impl std::fmt::Debug for CommandIo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandIo").field("cwd", &self.cwd).finish()
    }
}

/// The capabilities the core needs from an interactive shell.
pub trait ShellAdapter: VariableSurface {
    fn set_prompt(&mut self, prompt: &str);
    fn set_context(&mut self, context: BTreeMap<String, String>);
    fn pre_cmd(&mut self, hook: PreCmdFn);
    fn on_stdout(&mut self, hook: StreamFn);
    fn on_stderr(&mut self, hook: StreamFn);
    fn post_cmd(&mut self, hook: PostCmdFn);
    fn on_exit(&mut self, hook: ExitFn);
    fn register_runner(&mut self, runner: RunnerFn);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// --- Shared shell state ---

#[derive(Debug, Default)]
struct ShellState {
    variables: BTreeMap<String, String>,
    prompt: String,
    context: BTreeMap<String, String>,
}

/// Hook lists each sit behind their own lock: a runner emits output through
/// the stream hooks while it is itself borrowed.
#[derive(Default)]
struct ShellHooks {
    pre_cmd: Mutex<Vec<PreCmdFn>>,
    on_stdout: Mutex<Vec<StreamFn>>,
    on_stderr: Mutex<Vec<StreamFn>>,
    post_cmd: Mutex<Vec<PostCmdFn>>,
    on_exit: Mutex<Vec<ExitFn>>,
    runner: Mutex<Option<RunnerFn>>,
}

/// A cloneable handle on a shell's variables, prompt and hooks. The
/// supervisor holds one while the I/O thread drives the [`LineShell`].
#[derive(Clone, Default)]
pub struct ShellHandle {
    state: Arc<Mutex<ShellState>>,
    hooks: Arc<ShellHooks>,
}

impl std::fmt::Debug for ShellHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellHandle").field("state", &*lock(&self.state)).finish()
    }
}

impl ShellHandle {
    /// A shell whose variable table starts as a copy of `env`.
    pub fn from_env(env: &ProcessEnv) -> Self {
        let handle = Self::default();
        lock(&handle.state).variables = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        handle
    }

    pub fn variables(&self) -> HashMap<String, String> {
        lock(&self.state).variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn prompt(&self) -> String {
        lock(&self.state).prompt.clone()
    }

    pub fn context(&self) -> BTreeMap<String, String> {
        lock(&self.state).context.clone()
    }

    /// Runs and drops every exit hook. Later calls do nothing.
    pub fn fire_exit(&self) {
        let hooks: Vec<ExitFn> = lock(&self.hooks.on_exit).drain(..).collect();
        for hook in hooks {
            hook();
        }
    }
}

impl VariableSurface for ShellHandle {
    fn variable(&self, key: &str) -> Option<String> {
        lock(&self.state).variables.get(key).cloned()
    }

    fn set_variable(&mut self, key: &str, value: &str) {
        lock(&self.state).variables.insert(key.to_string(), value.to_string());
    }

    fn unset_variable(&mut self, key: &str) {
        lock(&self.state).variables.remove(key);
    }
}

impl ShellAdapter for ShellHandle {
    fn set_prompt(&mut self, prompt: &str) {
        lock(&self.state).prompt = prompt.to_string();
    }

    fn set_context(&mut self, context: BTreeMap<String, String>) {
        lock(&self.state).context = context;
    }

    fn pre_cmd(&mut self, hook: PreCmdFn) {
        lock(&self.hooks.pre_cmd).push(hook);
    }

    fn on_stdout(&mut self, hook: StreamFn) {
        lock(&self.hooks.on_stdout).push(hook);
    }

    fn on_stderr(&mut self, hook: StreamFn) {
        lock(&self.hooks.on_stderr).push(hook);
    }

    fn post_cmd(&mut self, hook: PostCmdFn) {
        lock(&self.hooks.post_cmd).push(hook);
    }

    fn on_exit(&mut self, hook: ExitFn) {
        lock(&self.hooks.on_exit).push(hook);
    }

    fn register_runner(&mut self, runner: RunnerFn) {
        *lock(&self.hooks.runner) = Some(runner);
    }
}

// --- Line shell ---

pub struct LineShell {
    handle: ShellHandle,
    shell: ShellSettings,
    cwd: PathBuf,
    history: Option<PathBuf>,
    cancellation_token: CancellationToken,
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
}

impl std::fmt::Debug for LineShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineShell")
            .field("shell", &self.shell)
            .field("cwd", &self.cwd)
            .field("history", &self.history)
            .finish()
    }
}

impl LineShell {
    pub fn new(
        handle: ShellHandle,
        shell: ShellSettings,
        cwd: PathBuf,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            handle,
            shell,
            cwd,
            history: None,
            cancellation_token,
            stdout: Box::new(io::stdout()),
            stderr: Box::new(io::stderr()),
        }
    }

    /// Appends every entered line to `path`.
    pub fn with_history(mut self, path: PathBuf) -> Self {
        self.history = Some(path);
        self
    }

    pub fn with_output(mut self, stdout: Box<dyn Write + Send>, stderr: Box<dyn Write + Send>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn handle(&self) -> &ShellHandle {
        &self.handle
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Reads and executes lines until `exit` or end of input, then fires the
    /// exit hooks. Returns the status of the last command.
    pub fn run_interactive<R: BufRead>(&mut self, input: R) -> io::Result<i32> {
        let mut status = 0;
        let mut lines = input.lines();
        loop {
            write!(self.stdout, "{}", self.handle.prompt())?;
            self.stdout.flush()?;
            let Some(line) = lines.next().transpose()? else {
                writeln!(self.stdout)?;
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.append_history(line);
            if line == "exit" {
                break;
            }
            status = self.execute_line(line);
        }
        self.handle.fire_exit();
        Ok(status)
    }

    fn append_history(&mut self, line: &str) {
        let Some(path) = &self.history else {
            return;
        };
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", line));
        if let Err(e) = written {
            log::warn!("Could not append to history '{}': {}", path.display(), e);
        }
    }

    fn report(&mut self, error: &dyn std::fmt::Display) {
        writeln!(self.stderr, "{}", error.to_string().red()).ok();
    }

    /// Runs one line: `pre_cmd` hooks, the command with its output streamed
    /// through the stream hooks, then `post_cmd` hooks. Returns the exit status.
    pub fn execute_line(&mut self, line: &str) -> i32 {
        let line = line.trim();
        if line.is_empty() {
            return 0;
        }

        let mut command = line.to_string();
        let mut hook_error = None;
        for hook in lock(&self.handle.hooks.pre_cmd).iter_mut() {
            match hook(&command) {
                Ok(rewritten) => command = rewritten,
                Err(e) => {
                    hook_error = Some(e);
                    break;
                }
            }
        }

        let mut stdout_text = String::new();
        let mut stderr_text = String::new();
        let mut status = match hook_error {
            Some(e) => {
                self.report(&e);
                1
            }
            None => self.run_command(&command, &mut stdout_text, &mut stderr_text),
        };

        let hooks = Arc::clone(&self.handle.hooks);
        for hook in lock(&hooks.post_cmd).iter_mut() {
            if let Err(e) = hook(&command, &stdout_text, &stderr_text) {
                self.report(&e);
                if status == 0 {
                    status = 1;
                }
            }
        }
        status
    }

    fn run_command(&mut self, command: &str, stdout_text: &mut String, stderr_text: &mut String) -> i32 {
        let mut words = command.split_whitespace();
        match words.next() {
            Some("cd") => return self.change_dir(words.next()),
            Some("context") if words.next().is_none() => {
                for (key, value) in self.handle.context() {
                    writeln!(self.stdout, "{} = {}", key, value).ok();
                }
                return 0;
            }
            _ => {}
        }

        let env = self.handle.variables();
        let hooks = Arc::clone(&self.handle.hooks);
        let stdout = &mut self.stdout;
        let stderr = &mut self.stderr;
        let mut emit = |stream: Stream, text: String| {
            let list = match stream {
                Stream::Stdout => &hooks.on_stdout,
                Stream::Stderr => &hooks.on_stderr,
            };
            let mut text = text;
            for hook in lock(list).iter_mut() {
                match hook(command, text.clone()) {
                    Ok(filtered) => text = filtered,
                    Err(e) => {
                        writeln!(stderr, "{}", e.to_string().red()).ok();
                    }
                }
            }
            match stream {
                Stream::Stdout => {
                    stdout_text.push_str(&text);
                    stdout.write_all(text.as_bytes()).ok();
                    stdout.flush().ok();
                }
                Stream::Stderr => {
                    stderr_text.push_str(&text);
                    stderr.write_all(text.as_bytes()).ok();
                    stderr.flush().ok();
                }
            }
        };

        let in_process = match lock(&hooks.runner).as_mut() {
            Some(runner) => {
                let mut io = CommandIo {
                    cwd: &mut self.cwd,
                    env: &env,
                    emit: &mut emit,
                };
                runner(command, &mut io)
            }
            None => None,
        };

        match in_process {
            Some(Ok(status)) => status,
            Some(Err(e)) => {
                self.report(&e);
                1
            }
            None => {
                let result = executor::run_shell_streaming(
                    &self.shell,
                    command,
                    &self.cwd,
                    &env,
                    &self.cancellation_token,
                    &mut emit,
                );
                match result {
                    Ok(status) => status,
                    Err(e) => {
                        self.report(&e);
                        127
                    }
                }
            }
        }
    }

    fn change_dir(&mut self, target: Option<&str>) -> i32 {
        let target = match target {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).as_ref()),
            None => dirs::home_dir().unwrap_or_else(|| self.cwd.clone()),
        };
        let next = dunce::simplified(&self.cwd.join(target)).to_path_buf();
        if !next.is_dir() {
            self.report(&format!("cd: no such directory: {}", next.display()));
            return 1;
        }
        self.cwd = dunce::canonicalize(&next).unwrap_or(next);
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8_lossy(&lock(&self.0)).into_owned()
        }
    }

    fn shell(handle: ShellHandle, cwd: &Path) -> (LineShell, SharedBuffer, SharedBuffer) {
        let out = SharedBuffer::default();
        let err = SharedBuffer::default();
        let shell = LineShell::new(
            handle,
            ShellSettings {
                path: "/bin/sh".into(),
                args: vec!["-c".to_string()],
            },
            cwd.to_path_buf(),
            Arc::new(AtomicBool::new(false)),
        )
        .with_output(Box::new(out.clone()), Box::new(err.clone()));
        (shell, out, err)
    }

    fn echo_runner(log: Arc<Mutex<Vec<String>>>) -> RunnerFn {
        Box::new(move |line: &str, io: &mut CommandIo| {
            let text = line.strip_prefix("say ")?;
            lock(&log).push("cmd".to_string());
            (io.emit)(Stream::Stdout, format!("{}\n", text));
            Some(Ok(0))
        })
    }

    #[test]
    fn test_handle_is_a_variable_surface() {
        let mut handle = ShellHandle::from_env(&ProcessEnv::from_pairs([("A", "1")]));
        assert_eq!(handle.variable("A").as_deref(), Some("1"));
        handle.set_variable("B", "2");
        handle.unset_variable("A");
        assert_eq!(handle.variables(), HashMap::from([("B".to_string(), "2".to_string())]));
    }

    #[test]
    fn test_hooks_run_around_the_command_in_order() {
        let dir = tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handle = ShellHandle::default();

        let l = Arc::clone(&log);
        handle.pre_cmd(Box::new(move |line: &str| {
            lock(&l).push("pre".to_string());
            Ok(line.replace("hi", "hello"))
        }));
        let l = Arc::clone(&log);
        handle.on_stdout(Box::new(move |_: &str, out: String| {
            lock(&l).push("out".to_string());
            Ok(out.to_uppercase())
        }));
        let l = Arc::clone(&log);
        handle.post_cmd(Box::new(move |command: &str, stdout: &str, _: &str| {
            lock(&l).push(format!("post {} -> {}", command, stdout.trim()));
            Ok(())
        }));
        handle.register_runner(echo_runner(Arc::clone(&log)));

        let (mut shell, out, _) = shell(handle, dir.path());
        assert_eq!(shell.execute_line("say hi"), 0);
        assert_eq!(out.text(), "HELLO\n");
        assert_eq!(
            *lock(&log),
            vec!["pre", "cmd", "out", "post say hello -> HELLO"]
        );
    }

    #[test]
    fn test_failing_precmd_skips_command_but_not_postcmd() {
        let dir = tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handle = ShellHandle::default();
        handle.pre_cmd(Box::new(|_: &str| {
            Err(DispatchError::HookStatus {
                location: "x.toml:[hooks.h]".to_string(),
                code: 2,
            })
        }));
        let l = Arc::clone(&log);
        handle.post_cmd(Box::new(move |_: &str, _: &str, _: &str| {
            lock(&l).push("post".to_string());
            Ok(())
        }));
        handle.register_runner(echo_runner(Arc::clone(&log)));

        let (mut shell, out, err) = shell(handle, dir.path());
        assert_eq!(shell.execute_line("say hi"), 1);
        assert!(out.text().is_empty());
        assert!(err.text().contains("UserHookError"));
        assert_eq!(*lock(&log), vec!["post"]);
    }

    #[test]
    fn test_cd_builtin_changes_the_working_directory() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let (mut shell, _, err) = shell(ShellHandle::default(), dir.path());

        assert_eq!(shell.execute_line("cd sub"), 0);
        assert!(shell.cwd().ends_with("sub"));
        assert_eq!(shell.execute_line("cd missing"), 1);
        assert!(err.text().contains("no such directory"));
    }

    #[test]
    fn test_session_stops_at_exit_and_records_history() {
        let dir = tempdir().unwrap();
        let history = dir.path().join("history");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handle = ShellHandle::default();
        handle.set_prompt("(sandbox)$ ");
        handle.register_runner(echo_runner(Arc::clone(&log)));
        let l = Arc::clone(&log);
        handle.on_exit(Box::new(move || lock(&l).push("exit".to_string())));

        let (shell, out, _) = shell(handle, dir.path());
        let mut shell = shell.with_history(history.clone());
        let status = shell.run_interactive("say one\n\nexit\nsay two\n".as_bytes()).unwrap();

        assert_eq!(status, 0);
        assert_eq!(*lock(&log), vec!["cmd", "exit"]);
        assert!(out.text().starts_with("(sandbox)$ one\n"));
        assert_eq!(std::fs::read_to_string(history).unwrap(), "say one\nexit\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_other_lines_go_to_the_system_shell_with_shell_variables() {
        let dir = tempdir().unwrap();
        let mut handle = ShellHandle::from_env(&ProcessEnv::from_current());
        handle.set_variable("STRATA_MARKER", "42");
        let (mut shell, out, _) = shell(handle, dir.path());
        assert_eq!(shell.execute_line("echo \"$STRATA_MARKER\"; exit 3"), 3);
        assert_eq!(out.text(), "42\n");
    }
}
