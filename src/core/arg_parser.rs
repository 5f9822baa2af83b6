// src/core/arg_parser.rs

use crate::script::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgError {
    #[error("Command line could not be tokenized: {0}")]
    Tokenize(String),
    #[error("'{command}' has no parameter named '{name}'")]
    UnknownNamed { command: String, name: String },
    #[error("'{command}' takes {expected} argument(s), unexpected: {extra}")]
    Extra {
        command: String,
        expected: usize,
        extra: String,
    },
}

#[derive(Debug, Clone)]
struct PositionalArg<'a> {
    value: &'a str,
    consumed: bool,
}

#[derive(Debug, Clone)]
struct NamedArg<'a> {
    value: Option<&'a str>, // Some("val") for --key val, None for --key
    consumed: bool,
}

/// The arguments typed after a command name, classified into positional and
/// named (flags), with consumption tracking.
#[derive(Debug, Clone)]
pub struct ParsedArgs<'a> {
    positional: Vec<PositionalArg<'a>>,
    named: HashMap<String, NamedArg<'a>>,
}

impl<'a> ParsedArgs<'a> {
    /// Classifies raw tokens.
    ///
    /// # Logic:
    /// - Any token starting with `-` or `--` is a named argument (flag).
    /// - If a flag is followed by a token that is *not* a flag, that token is
    ///   considered the value for the flag.
    /// - `--` ends flag parsing; everything after it is positional.
    /// - Otherwise, it's a positional argument.
    pub fn new(tokens: &'a [String]) -> Self {
        let mut positional = Vec::new();
        let mut named = HashMap::new();
        let mut tokens_iter = tokens.iter().map(String::as_str).peekable();
        let mut flags_done = false;

        while let Some(token) = tokens_iter.next() {
            if flags_done {
                positional.push(PositionalArg {
                    value: token,
                    consumed: false,
                });
                continue;
            }
            if token == "--" {
                flags_done = true;
                continue;
            }

            let name_opt = token
                .strip_prefix("--")
                .or_else(|| token.strip_prefix('-'))
                .filter(|name| !name.is_empty() && !name.starts_with(|c: char| c.is_ascii_digit()));

            if let Some(name) = name_opt {
                let (name, inline_value) = match name.split_once('=') {
                    Some((name, value)) => (name, Some(value)),
                    None => (name, None),
                };
                let value = inline_value.or_else(|| tokens_iter.next_if(|next| !next.starts_with('-')));
                named.insert(
                    name.replace('-', "_"),
                    NamedArg {
                        value,
                        consumed: false,
                    },
                );
            } else {
                positional.push(PositionalArg {
                    value: token,
                    consumed: false,
                });
            }
        }

        Self { positional, named }
    }

    /// Retrieves a named argument and marks it consumed. A bare flag reads as `true`.
    pub fn take_named(&mut self, name: &str) -> Option<Value> {
        let arg = self.named.get_mut(name)?;
        arg.consumed = true;
        Some(match arg.value {
            Some(value) => Value::str(value),
            None => Value::Bool(true),
        })
    }

    /// Retrieves the next unconsumed positional argument.
    pub fn take_positional(&mut self) -> Option<Value> {
        let arg = self.positional.iter_mut().find(|arg| !arg.consumed)?;
        arg.consumed = true;
        Some(Value::str(arg.value))
    }

    /// Unconsumed arguments, flags in a deterministic order.
    pub fn remaining(&self) -> Vec<String> {
        let mut remaining_parts: Vec<String> = self
            .positional
            .iter()
            .filter(|arg| !arg.consumed)
            .map(|arg| arg.value.to_string())
            .collect();

        let mut named_keys: Vec<_> = self.named.iter().filter(|(_, arg)| !arg.consumed).collect();
        named_keys.sort_by(|a, b| a.0.cmp(b.0));
        for (name, arg) in named_keys {
            remaining_parts.push(format!("--{}", name));
            if let Some(val) = arg.value {
                remaining_parts.push(val.to_string());
            }
        }
        remaining_parts
    }

    pub fn all_consumed(&self) -> bool {
        self.positional.iter().all(|arg| arg.consumed) && self.named.values().all(|arg| arg.consumed)
    }
}

/// Tokenizes the text after a command name with shell quoting rules.
pub fn tokenize(args: &str) -> Result<Vec<String>, ArgError> {
    shlex::split(args).ok_or_else(|| ArgError::Tokenize(args.to_string()))
}

/// Maps CLI-style arguments onto a command's parameter list.
///
/// Named arguments bind by name first; positional ones fill the remaining
/// parameters in order. Parameters left unbound are `null`.
pub fn bind(command: &str, params: &[String], tokens: &[String]) -> Result<Vec<(String, Value)>, ArgError> {
    let mut parsed = ParsedArgs::new(tokens);

    if let Some(unknown) = parsed.named.keys().find(|name| !params.contains(name)) {
        return Err(ArgError::UnknownNamed {
            command: command.to_string(),
            name: unknown.clone(),
        });
    }

    let mut bound: Vec<(String, Option<Value>)> =
        params.iter().map(|p| (p.clone(), parsed.take_named(p))).collect();
    for (_, slot) in bound.iter_mut().filter(|(_, slot)| slot.is_none()) {
        *slot = parsed.take_positional();
    }

    if !parsed.all_consumed() {
        return Err(ArgError::Extra {
            command: command.to_string(),
            expected: params.len(),
            extra: parsed.remaining().join(" "),
        });
    }

    Ok(bound
        .into_iter()
        .map(|(name, value)| (name, value.unwrap_or(Value::Null)))
        .collect())
}
