// src/script/builtins.rs

use super::{
    ScriptError,
    value::{Builtin, Value},
};
use crate::{
    CancellationToken,
    models::{Settings, ShellSettings},
    system::executor::{self, Stream},
};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, atomic::AtomicBool},
};

/// Longest string `*` may build.
const MAX_REPEAT_BYTES: usize = 1 << 24;

/// What scripts see of the session: the variables children are spawned
/// with, the directory they start in and the system shell that runs `sh`.
#[derive(Debug, Clone)]
pub struct ScriptHost {
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
    pub shell: ShellSettings,
    pub cancellation_token: CancellationToken,
}

impl ScriptHost {
    pub fn new(
        env: HashMap<String, String>,
        cwd: PathBuf,
        shell: ShellSettings,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            env,
            cwd,
            shell,
            cancellation_token,
        }
    }

    /// The current process, for scripts evaluated outside a session.
    pub fn from_process() -> Self {
        Self {
            env: std::env::vars().collect(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            shell: Settings::default().shell,
            cancellation_token: Arc::new(AtomicBool::new(false)),
        }
    }
}

const BUILTINS: &[Builtin] = &[
    Builtin { name: "len", func: len },
    Builtin { name: "str", func: to_str },
    Builtin { name: "int", func: to_int },
    Builtin { name: "float", func: to_float },
    Builtin { name: "upper", func: upper },
    Builtin { name: "lower", func: lower },
    Builtin { name: "replace", func: replace },
    Builtin { name: "join", func: join },
    Builtin { name: "contains", func: contains },
    Builtin { name: "getenv", func: getenv },
    Builtin { name: "sh", func: sh },
    Builtin { name: "print", func: print },
];

pub fn lookup(name: &str) -> Option<Builtin> {
    BUILTINS.iter().find(|b| b.name == name).copied()
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), ScriptError> {
    if args.len() != expected {
        return Err(ScriptError::Arity {
            callee: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn arg<'a>(name: &str, args: &'a [Value], position: usize) -> Result<&'a Value, ScriptError> {
    args.get(position).ok_or_else(|| ScriptError::Arity {
        callee: name.to_string(),
        expected: position + 1,
        got: args.len(),
    })
}

fn string_arg<'a>(name: &str, value: &'a Value) -> Result<&'a str, ScriptError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(ScriptError::Type(format!(
            "{}() expects a string, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn len(_host: &ScriptHost, args: &[Value]) -> Result<Value, ScriptError> {
    arity("len", args, 1)?;
    let n = match arg("len", args, 0)? {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.len(),
        Value::Dict(dict) => dict.len(),
        other => return Err(ScriptError::Type(format!("{} has no len()", other.type_name()))),
    };
    Ok(Value::Int(i64::try_from(n).unwrap_or(i64::MAX)))
}

fn to_str(_host: &ScriptHost, args: &[Value]) -> Result<Value, ScriptError> {
    arity("str", args, 1)?;
    Ok(Value::Str(arg("str", args, 0)?.to_string()))
}

#[allow(clippy::cast_possible_truncation)]
fn to_int(_host: &ScriptHost, args: &[Value]) -> Result<Value, ScriptError> {
    arity("int", args, 1)?;
    match arg("int", args, 0)? {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| ScriptError::Type(format!("invalid literal for int(): '{}'", s))),
        other => Err(ScriptError::Type(format!("int() cannot convert {}", other.type_name()))),
    }
}

fn to_float(_host: &ScriptHost, args: &[Value]) -> Result<Value, ScriptError> {
    arity("float", args, 1)?;
    match arg("float", args, 0)? {
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| ScriptError::Type(format!("invalid literal for float(): '{}'", s))),
        other => Err(ScriptError::Type(format!("float() cannot convert {}", other.type_name()))),
    }
}

fn upper(_host: &ScriptHost, args: &[Value]) -> Result<Value, ScriptError> {
    arity("upper", args, 1)?;
    Ok(Value::Str(string_arg("upper", arg("upper", args, 0)?)?.to_uppercase()))
}

fn lower(_host: &ScriptHost, args: &[Value]) -> Result<Value, ScriptError> {
    arity("lower", args, 1)?;
    Ok(Value::Str(string_arg("lower", arg("lower", args, 0)?)?.to_lowercase()))
}

fn replace(_host: &ScriptHost, args: &[Value]) -> Result<Value, ScriptError> {
    arity("replace", args, 3)?;
    let haystack = string_arg("replace", arg("replace", args, 0)?)?;
    let from = string_arg("replace", arg("replace", args, 1)?)?;
    let to = string_arg("replace", arg("replace", args, 2)?)?;
    Ok(Value::Str(haystack.replace(from, to)))
}

fn join(_host: &ScriptHost, args: &[Value]) -> Result<Value, ScriptError> {
    arity("join", args, 2)?;
    let separator = string_arg("join", arg("join", args, 1)?)?;
    match arg("join", args, 0)? {
        Value::List(items) => Ok(Value::Str(
            items.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(separator),
        )),
        other => Err(ScriptError::Type(format!("join() expects a list, got {}", other.type_name()))),
    }
}

fn contains(_host: &ScriptHost, args: &[Value]) -> Result<Value, ScriptError> {
    arity("contains", args, 2)?;
    let found = match (arg("contains", args, 0)?, arg("contains", args, 1)?) {
        (Value::Str(haystack), Value::Str(needle)) => haystack.contains(needle.as_str()),
        (Value::List(items), needle) => items.iter().any(|item| item.same_value(needle)),
        (Value::Dict(dict), Value::Str(key)) => dict.get(key).is_some(),
        (container, _) => {
            return Err(ScriptError::Type(format!(
                "contains() cannot search a {}",
                container.type_name()
            )));
        }
    };
    Ok(Value::Bool(found))
}

/// `getenv(name)` or `getenv(name, default)`, read from the session's variables.
fn getenv(host: &ScriptHost, args: &[Value]) -> Result<Value, ScriptError> {
    if args.is_empty() || args.len() > 2 {
        return Err(ScriptError::Arity {
            callee: "getenv".to_string(),
            expected: 2,
            got: args.len(),
        });
    }
    let name = string_arg("getenv", arg("getenv", args, 0)?)?;
    Ok(match host.env.get(name) {
        Some(value) => Value::Str(value.clone()),
        None => args.get(1).cloned().unwrap_or(Value::Null),
    })
}

/// Runs a line through the system shell with the session's variables and
/// returns its standard output without the trailing newline. Standard error
/// passes through; a non-zero exit is an error.
fn sh(host: &ScriptHost, args: &[Value]) -> Result<Value, ScriptError> {
    arity("sh", args, 1)?;
    let line = string_arg("sh", arg("sh", args, 0)?)?;
    let mut out = String::new();
    let code = executor::run_shell_streaming(
        &host.shell,
        line,
        &host.cwd,
        &host.env,
        &host.cancellation_token,
        &mut |stream, text| match stream {
            Stream::Stdout => out.push_str(&text),
            Stream::Stderr => eprint!("{}", text),
        },
    )
    .map_err(|e| ScriptError::Runtime(e.to_string()))?;
    if code != 0 {
        return Err(ScriptError::Runtime(format!("sh(\"{}\") exited with code {}", line, code)));
    }
    Ok(Value::Str(out.trim_end_matches(['\n', '\r']).to_string()))
}

/// `text * n` with a bound on the result size.
pub fn repeat(text: &str, times: i64) -> Result<String, ScriptError> {
    let times = usize::try_from(times).unwrap_or(0);
    if text.len().saturating_mul(times) > MAX_REPEAT_BYTES {
        return Err(ScriptError::Runtime(format!(
            "string repetition would exceed {} bytes",
            MAX_REPEAT_BYTES
        )));
    }
    Ok(text.repeat(times))
}

fn print(_host: &ScriptHost, args: &[Value]) -> Result<Value, ScriptError> {
    let line = args.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
    println!("{}", line);
    Ok(Value::Null)
}
