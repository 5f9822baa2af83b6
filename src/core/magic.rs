// src/core/magic.rs

use crate::{
    models::{CommandDecl, ContextDecl, HookDecl},
    script::{ScriptError, ast::Expr, parser},
};
use regex::Regex;
use serde::Serialize;
use std::{fmt, path::{Path, PathBuf}};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MagicError {
    #[error("{location}: unknown hook kind '{kind}'")]
    UnknownKind { location: String, kind: String },
    #[error("{location}: exactly one of 'expr' or 'run' must be given")]
    Body { location: String },
    #[error("{location}: invalid command regex '{pattern}': {source}")]
    Regex {
        location: String,
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },
    #[error("{location}: {source}")]
    Script {
        location: String,
        #[source]
        source: ScriptError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MagicKind {
    Command,
    Context,
    Precmd,
    Onstdout,
    Onstderr,
    Postcmd,
    Onload,
    Onunload,
    Oncreate,
    Ondestroy,
    BootCode,
}

impl MagicKind {
    pub fn parse_hook(name: &str) -> Option<Self> {
        match name {
            "precmd" => Some(Self::Precmd),
            "onstdout" => Some(Self::Onstdout),
            "onstderr" => Some(Self::Onstderr),
            "postcmd" => Some(Self::Postcmd),
            "onload" => Some(Self::Onload),
            "onunload" => Some(Self::Onunload),
            "oncreate" => Some(Self::Oncreate),
            "ondestroy" => Some(Self::Ondestroy),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Context => "context",
            Self::Precmd => "precmd",
            Self::Onstdout => "onstdout",
            Self::Onstderr => "onstderr",
            Self::Postcmd => "postcmd",
            Self::Onload => "onload",
            Self::Onunload => "onunload",
            Self::Oncreate => "oncreate",
            Self::Ondestroy => "ondestroy",
            Self::BootCode => "boot_code",
        }
    }

    /// The fixed parameter names of a hook kind. Commands take free parameters.
    pub fn expected_params(self) -> Option<&'static [&'static str]> {
        match self {
            Self::Precmd => Some(&["command"]),
            Self::Onstdout | Self::Onstderr => Some(&["command", "out"]),
            Self::Postcmd => Some(&["command", "stdout", "stderr"]),
            Self::Onload | Self::Onunload | Self::Oncreate | Self::Ondestroy => Some(&[]),
            Self::Command | Self::Context | Self::BootCode => None,
        }
    }

    /// Hooks that run around a shell command and filter by regex.
    pub fn is_command_hook(self) -> bool {
        matches!(self, Self::Precmd | Self::Onstdout | Self::Onstderr | Self::Postcmd)
    }
}

impl fmt::Display for MagicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a magic function does when called.
#[derive(Debug, Clone)]
pub enum MagicBody {
    /// A script expression evaluated in the definition scope.
    Expr(Expr),
    /// A shell command template; `{expr}` parts are interpolated first.
    Shell(Expr),
    /// Context entries: name to expression.
    Context(Vec<(String, Expr)>),
}

/// A command, context, hook or lifecycle handler declared by a layer.
#[derive(Debug, Clone)]
pub struct MagicFunction {
    pub kind: MagicKind,
    pub name: String,
    pub namespace: Option<String>,
    pub cmd_regex: Option<Regex>,
    pub params: Vec<String>,
    pub body: MagicBody,
    pub origin: PathBuf,
    pub in_root: bool,
    pub cd_back: bool,
}

impl MagicFunction {
    /// `<namespace>.<name>`, or just `<name>` without a namespace.
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, self.name),
            None => self.name.clone(),
        }
    }

    /// Registry key: a child layer's entry with the same key shadows the parent's.
    pub fn key(&self) -> (MagicKind, Option<String>, String) {
        (self.kind, self.namespace.clone(), self.name.clone())
    }

    pub fn location(&self) -> String {
        let table = match self.kind {
            MagicKind::Command => "commands",
            MagicKind::Context => "contexts",
            MagicKind::BootCode => "env.boot_code",
            _ => "hooks",
        };
        format!("{}:[{}.{}]", self.origin.display(), table, self.name)
    }

    /// Whether a command hook applies to `line`. Regexes are anchored at the
    /// start of the line.
    pub fn matches(&self, line: &str) -> bool {
        match &self.cmd_regex {
            Some(regex) => regex.is_match(line),
            None => true,
        }
    }
}

fn location(origin: &Path, table: &str, name: &str) -> String {
    format!("{}:[{}.{}]", origin.display(), table, name)
}

fn parse_body(
    location: &str,
    expr: Option<&str>,
    run: Option<&str>,
) -> Result<MagicBody, MagicError> {
    match (expr, run) {
        (Some(expr), None) => parser::parse_expr(expr, location)
            .map(MagicBody::Expr)
            .map_err(|source| MagicError::Script {
                location: location.to_string(),
                source,
            }),
        (None, Some(run)) => parser::parse_text_template(run, location)
            .map(MagicBody::Shell)
            .map_err(|source| MagicError::Script {
                location: location.to_string(),
                source,
            }),
        _ => Err(MagicError::Body {
            location: location.to_string(),
        }),
    }
}

pub fn command_from_decl(name: &str, decl: &CommandDecl, origin: &Path) -> Result<MagicFunction, MagicError> {
    let location = location(origin, "commands", name);
    Ok(MagicFunction {
        kind: MagicKind::Command,
        name: name.to_string(),
        namespace: decl.namespace.clone(),
        cmd_regex: None,
        params: decl.params.clone(),
        body: parse_body(&location, decl.expr.as_deref(), decl.run.as_deref())?,
        origin: origin.to_path_buf(),
        in_root: decl.in_root,
        cd_back: decl.cd_back,
    })
}

pub fn hook_from_decl(name: &str, decl: &HookDecl, origin: &Path) -> Result<MagicFunction, MagicError> {
    let location = location(origin, "hooks", name);
    let kind = MagicKind::parse_hook(&decl.kind).ok_or_else(|| MagicError::UnknownKind {
        location: location.clone(),
        kind: decl.kind.clone(),
    })?;

    let cmd_regex = if kind.is_command_hook() {
        let pattern = decl.cmd_regex.clone().unwrap_or_else(|| ".*".to_string());
        let anchored = format!("^(?:{})", pattern);
        Some(Regex::new(&anchored).map_err(|e| MagicError::Regex {
            location: location.clone(),
            pattern,
            source: Box::new(e),
        })?)
    } else {
        None
    };

    let params = decl.params.clone().unwrap_or_else(|| {
        kind.expected_params()
            .unwrap_or_default()
            .iter()
            .map(|p| p.to_string())
            .collect()
    });

    Ok(MagicFunction {
        kind,
        name: name.to_string(),
        namespace: decl.namespace.clone(),
        cmd_regex,
        params,
        body: parse_body(&location, decl.expr.as_deref(), decl.run.as_deref())?,
        origin: origin.to_path_buf(),
        in_root: false,
        cd_back: true,
    })
}

pub fn context_from_decl(name: &str, decl: &ContextDecl, origin: &Path) -> Result<MagicFunction, MagicError> {
    let location = location(origin, "contexts", name);
    let entries = decl
        .values
        .iter()
        .map(|(key, source)| {
            parser::parse_expr(source, &location)
                .map(|expr| (key.clone(), expr))
                .map_err(|source| MagicError::Script {
                    location: location.clone(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(MagicFunction {
        kind: MagicKind::Context,
        name: name.to_string(),
        namespace: decl.namespace.clone(),
        cmd_regex: None,
        params: Vec::new(),
        body: MagicBody::Context(entries),
        origin: origin.to_path_buf(),
        in_root: false,
        cd_back: true,
    })
}

pub fn boot_code(index: usize, line: &str, origin: &Path) -> Result<MagicFunction, MagicError> {
    let location = format!("{}:[env.boot_code.{}]", origin.display(), index);
    let body = parser::parse_text_template(line, &location)
        .map(MagicBody::Shell)
        .map_err(|source| MagicError::Script { location, source })?;
    Ok(MagicFunction {
        kind: MagicKind::BootCode,
        name: index.to_string(),
        namespace: None,
        cmd_regex: None,
        params: Vec::new(),
        body,
        origin: origin.to_path_buf(),
        in_root: false,
        cd_back: true,
    })
}
