// src/system/dispatcher.rs

//! Runs the commands and hooks of the active environment inside the shell.
//!
//! The registration (commands, hooks, definition scope) is swapped as a whole
//! on every reload, so a line always sees one consistent environment.

use super::{
    executor::{self, ExecutionError, Stream},
    shell::{CommandIo, ShellAdapter},
};
use crate::{
    CancellationToken,
    core::{
        arg_parser::{self, ArgError},
        composer::{ComposedEnv, MagicRegistry},
        magic::{MagicBody, MagicFunction, MagicKind},
    },
    models::ShellSettings,
    script::{
        ModuleObj, ScriptError, ScriptHost, Value,
        ast::Expr,
        interp::{self, Scope},
        parser,
    },
};
use colored::Colorize;
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{Arc, RwLock},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("UserHookError: {location}: {source}")]
    UserHook {
        location: String,
        #[source]
        source: ScriptError,
    },
    #[error("UserHookError: {location}: {source}")]
    HookExecution {
        location: String,
        #[source]
        source: ExecutionError,
    },
    #[error("UserHookError: {location}: shell exited with status {code}")]
    HookStatus { location: String, code: i32 },
    #[error("{location}: {source}")]
    Command {
        location: String,
        #[source]
        source: ScriptError,
    },
    #[error(transparent)]
    Args(#[from] ArgError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// How a line typed in the shell is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// `name arg --flag v`: rewritten into a call through the argument adapter.
    Command { name: String, args: String },
    /// `name(expr, ...)`: an explicit call, evaluated as written.
    Call { name: String },
    /// Anything else goes to the system shell.
    Shell,
}

#[derive(Debug)]
struct Registration {
    magic: MagicRegistry,
    scope: Arc<ModuleObj>,
    root: PathBuf,
    env: HashMap<String, String>,
    /// Session seen by hooks and contexts: the registered variables, rooted
    /// at the project.
    host: Arc<ScriptHost>,
    verbose: bool,
}

impl Registration {
    fn empty() -> Self {
        Self {
            magic: MagicRegistry::default(),
            scope: Arc::new(ModuleObj::new("<empty>", None, "")),
            root: PathBuf::from("."),
            env: HashMap::new(),
            host: Arc::new(ScriptHost::from_process()),
            verbose: false,
        }
    }

    fn scope(&self, locals: &[(&str, Value)]) -> Scope {
        self.scope_on(Arc::clone(&self.host), locals)
    }

    fn scope_on(&self, host: Arc<ScriptHost>, locals: &[(&str, Value)]) -> Scope {
        let mut scope = Scope::new(Some(Arc::clone(&self.scope))).with_host(Some(host));
        for (name, value) in locals {
            scope.bind(*name, value.clone());
        }
        scope
    }
}

pub struct Dispatcher {
    current: RwLock<Arc<Registration>>,
    shell: ShellSettings,
    cancellation_token: CancellationToken,
    debug: bool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("commands", &self.command_names())
            .finish()
    }
}

impl Dispatcher {
    /// `debug` echoes every shell command before it runs, like `verbose_run`.
    pub fn new(shell: ShellSettings, cancellation_token: CancellationToken, debug: bool) -> Self {
        Self {
            current: RwLock::new(Arc::new(Registration::empty())),
            shell,
            cancellation_token,
            debug,
        }
    }

    fn current(&self) -> Arc<Registration> {
        self.current
            .read()
            .map(|r| Arc::clone(&r))
            .unwrap_or_else(|_| Arc::new(Registration::empty()))
    }

    /// Swaps in the commands and hooks of `env` as one unit. `vars` is the
    /// variable table children of hooks and commands run with.
    pub fn register(&self, env: &ComposedEnv, vars: HashMap<String, String>) {
        let host = ScriptHost::new(
            vars.clone(),
            env.root.clone(),
            self.shell.clone(),
            Arc::clone(&self.cancellation_token),
        );
        let registration = Registration {
            magic: env.magic.clone(),
            scope: Arc::clone(env.tree.scope()),
            root: env.root.clone(),
            env: vars,
            host: Arc::new(host),
            verbose: env.verbose_run || self.debug,
        };
        log::debug!(
            "Registering {} command(s) of '{}'.",
            registration.magic.command_names().len(),
            env.name
        );
        if let Ok(mut slot) = self.current.write() {
            *slot = Arc::new(registration);
        }
    }

    pub fn command_names(&self) -> Vec<String> {
        self.current().magic.command_names()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Wires the dispatcher into a shell host.
    pub fn install(self: &Arc<Self>, shell: &mut dyn ShellAdapter) {
        let this = Arc::clone(self);
        shell.pre_cmd(Box::new(move |line: &str| this.run_precmd(line)));
        let this = Arc::clone(self);
        shell.on_stdout(Box::new(move |command: &str, out: String| {
            this.filter_output(MagicKind::Onstdout, command, out)
        }));
        let this = Arc::clone(self);
        shell.on_stderr(Box::new(move |command: &str, out: String| {
            this.filter_output(MagicKind::Onstderr, command, out)
        }));
        let this = Arc::clone(self);
        shell.post_cmd(Box::new(move |command: &str, stdout: &str, stderr: &str| {
            this.run_postcmd(command, stdout, stderr)
        }));
        let this = Arc::clone(self);
        shell.register_runner(Box::new(move |line: &str, io: &mut CommandIo| this.run_line(line, io)));
    }

    // --- Line classification ---

    pub fn classify(&self, line: &str) -> LineKind {
        let registration = self.current();
        let trimmed = line.trim();
        let head_end = trimmed
            .find(|c: char| c.is_whitespace() || c == '(')
            .unwrap_or(trimmed.len());
        let (head, rest) = trimmed.split_at(head_end);
        if registration.magic.command(head).is_none() {
            return LineKind::Shell;
        }
        if rest.starts_with('(') {
            return LineKind::Call { name: head.to_string() };
        }
        LineKind::Command {
            name: head.to_string(),
            args: rest.trim().to_string(),
        }
    }

    /// Runs `line` if it names a registered command. `None` means the line
    /// belongs to the system shell.
    pub fn run_line(&self, line: &str, io: &mut CommandIo) -> Option<Result<i32, DispatchError>> {
        let registration = self.current();
        match self.classify(line) {
            LineKind::Shell => None,
            LineKind::Command { name, args } => {
                let function = registration.magic.command(&name)?;
                let result = arg_parser::tokenize(&args)
                    .and_then(|tokens| arg_parser::bind(&name, &function.params, &tokens))
                    .map_err(DispatchError::from)
                    .and_then(|bound| self.call_command(&registration, function, bound, io));
                Some(result)
            }
            LineKind::Call { name } => {
                let function = registration.magic.command(&name)?;
                let result = explicit_args(&registration, function, line)
                    .and_then(|bound| self.call_command(&registration, function, bound, io));
                Some(result)
            }
        }
    }

    fn call_command(
        &self,
        registration: &Registration,
        function: &MagicFunction,
        bound: Vec<(String, Value)>,
        io: &mut CommandIo,
    ) -> Result<i32, DispatchError> {
        let previous = io.cwd.clone();
        if function.in_root {
            *io.cwd = registration.root.clone();
        }

        // Commands see the shell's own variables and working directory.
        let host = ScriptHost::new(
            io.env.clone(),
            io.cwd.clone(),
            self.shell.clone(),
            Arc::clone(&self.cancellation_token),
        );
        let mut scope = registration.scope_on(Arc::new(host), &[]);
        for (name, value) in bound {
            scope.bind(name, value);
        }

        let cd_back = function.cd_back;
        let mut guard = scopeguard::guard(io, move |io: &mut CommandIo| {
            if cd_back {
                *io.cwd = previous;
            }
        });
        let io: &mut CommandIo = &mut guard;

        let command_error = |source| DispatchError::Command {
            location: function.location(),
            source,
        };
        match &function.body {
            MagicBody::Expr(expr) => {
                let value = interp::eval(expr, &scope).map_err(command_error)?;
                if !value.is_null() {
                    (io.emit)(Stream::Stdout, format!("{}\n", value));
                }
                Ok(0)
            }
            MagicBody::Shell(template) => {
                let line = interp::eval(template, &scope).map_err(command_error)?.to_string();
                if registration.verbose {
                    eprintln!("{} {}", "$".dimmed(), line);
                }
                let code = executor::run_shell_streaming(
                    &self.shell,
                    &line,
                    &*io.cwd,
                    io.env,
                    &self.cancellation_token,
                    &mut *io.emit,
                )?;
                Ok(code)
            }
            MagicBody::Context(_) => Ok(0),
        }
    }

    // --- Hooks ---

    fn eval_hook(
        &self,
        registration: &Registration,
        hook: &MagicFunction,
        locals: &[(&str, Value)],
    ) -> Result<Value, DispatchError> {
        let scope = registration.scope(locals);
        match &hook.body {
            MagicBody::Expr(expr) => interp::eval(expr, &scope).map_err(|source| DispatchError::UserHook {
                location: hook.location(),
                source,
            }),
            MagicBody::Shell(template) => {
                let line = interp::eval(template, &scope)
                    .map_err(|source| DispatchError::UserHook {
                        location: hook.location(),
                        source,
                    })?
                    .to_string();
                self.run_side_effect(registration, &hook.location(), &line)?;
                Ok(Value::Null)
            }
            MagicBody::Context(_) => Ok(Value::Null),
        }
    }

    /// Runs a hook's shell body. Its output goes straight to the terminal.
    fn run_side_effect(
        &self,
        registration: &Registration,
        location: &str,
        line: &str,
    ) -> Result<(), DispatchError> {
        if registration.verbose {
            eprintln!("{} {}", "$".dimmed(), line);
        }
        let code = executor::run_shell_streaming(
            &self.shell,
            line,
            &registration.root,
            &registration.env,
            &self.cancellation_token,
            &mut |stream, text| match stream {
                Stream::Stdout => print!("{}", text),
                Stream::Stderr => eprint!("{}", text),
            },
        )
        .map_err(|source| DispatchError::HookExecution {
            location: location.to_string(),
            source,
        })?;
        if code != 0 {
            return Err(DispatchError::HookStatus {
                location: location.to_string(),
                code,
            });
        }
        Ok(())
    }

    /// Applies every matching `precmd` hook in registration order. A hook
    /// returning a string replaces the command line.
    pub fn run_precmd(&self, line: &str) -> Result<String, DispatchError> {
        let registration = self.current();
        let mut command = line.to_string();
        for hook in registration.magic.of_kind(MagicKind::Precmd).filter(|h| h.matches(line)) {
            let result = self.eval_hook(&registration, hook, &[("command", Value::str(command.clone()))])?;
            if let Some(rewritten) = rewritten_text(result) {
                log::debug!("'{}' rewrote the command to '{}'.", hook.qualified_name(), rewritten);
                command = rewritten;
            }
        }
        Ok(command)
    }

    /// Passes one chunk of command output through the matching stream hooks.
    pub fn filter_output(
        &self,
        kind: MagicKind,
        command: &str,
        out: String,
    ) -> Result<String, DispatchError> {
        let registration = self.current();
        let mut out = out;
        for hook in registration.magic.of_kind(kind).filter(|h| h.matches(command)) {
            let locals = [("command", Value::str(command)), ("out", Value::str(out.clone()))];
            if let Some(rewritten) = rewritten_text(self.eval_hook(&registration, hook, &locals)?) {
                out = rewritten;
            }
        }
        Ok(out)
    }

    pub fn run_postcmd(&self, command: &str, stdout: &str, stderr: &str) -> Result<(), DispatchError> {
        let registration = self.current();
        for hook in registration.magic.of_kind(MagicKind::Postcmd).filter(|h| h.matches(command)) {
            let locals = [
                ("command", Value::str(command)),
                ("stdout", Value::str(stdout)),
                ("stderr", Value::str(stderr)),
            ];
            self.eval_hook(&registration, hook, &locals)?;
        }
        Ok(())
    }

    /// Runs `onload`, `onunload`, `oncreate` or `ondestroy` hooks in order,
    /// stopping at the first failure.
    pub fn run_lifecycle(&self, kind: MagicKind) -> Result<(), DispatchError> {
        let registration = self.current();
        for hook in registration.magic.of_kind(kind) {
            log::debug!("Running {} hook '{}'.", kind, hook.qualified_name());
            self.eval_hook(&registration, hook, &[])?;
        }
        Ok(())
    }

    /// Runs the environment's boot code lines through the system shell.
    pub fn run_boot_code(&self) -> Result<(), DispatchError> {
        let registration = self.current();
        for boot in registration.magic.of_kind(MagicKind::BootCode) {
            self.eval_hook(&registration, boot, &[])?;
        }
        Ok(())
    }

    /// Evaluates every context into `<namespace>.<context>.<key>` entries.
    pub fn contexts(&self) -> Result<BTreeMap<String, String>, DispatchError> {
        let registration = self.current();
        let scope = registration.scope(&[]);
        let mut values = BTreeMap::new();
        for context in registration.magic.of_kind(MagicKind::Context) {
            let MagicBody::Context(entries) = &context.body else {
                continue;
            };
            for (key, expr) in entries {
                let value = interp::eval(expr, &scope).map_err(|source| DispatchError::UserHook {
                    location: context.location(),
                    source,
                })?;
                values.insert(format!("{}.{}", context.qualified_name(), key), value.to_string());
            }
        }
        Ok(values)
    }

    pub fn root(&self) -> PathBuf {
        self.current().root.clone()
    }
}

/// A hook result replaces the text unless it is `null`.
fn rewritten_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Str(text) => Some(text),
        other => Some(other.to_string()),
    }
}

/// Evaluates the arguments of an explicit call `name(a, b)` and binds them
/// positionally.
fn explicit_args(
    registration: &Registration,
    function: &MagicFunction,
    line: &str,
) -> Result<Vec<(String, Value)>, DispatchError> {
    let location = function.location();
    let expr = parser::parse_expr(line.trim(), "<command line>").map_err(|source| DispatchError::Command {
        location: location.clone(),
        source,
    })?;
    let Expr::Call(_, args) = expr else {
        return Err(DispatchError::Command {
            location,
            source: ScriptError::Type(format!("'{}' is not a call", line.trim())),
        });
    };
    if args.len() > function.params.len() {
        return Err(ArgError::Extra {
            command: function.qualified_name(),
            expected: function.params.len(),
            extra: format!("{} argument(s)", args.len() - function.params.len()),
        }
        .into());
    }

    let scope = registration.scope(&[]);
    let mut values = args
        .iter()
        .map(|arg| interp::eval(arg, &scope))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| DispatchError::Command {
            location: location.clone(),
            source,
        })?
        .into_iter();
    Ok(function
        .params
        .iter()
        .map(|param| (param.clone(), values.next().unwrap_or(Value::Null)))
        .collect())
}
