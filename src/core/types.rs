// src/core/types.rs

use crate::script::Value;
use std::{
    fmt,
    path::Path,
};

/// A parsed variable type annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSpec {
    Str,
    Int,
    Float,
    Bool,
    Path,
    Any,
    List(Box<TypeSpec>),
    Dict(Box<TypeSpec>),
    Union(Vec<TypeSpec>),
    Optional(Box<TypeSpec>),
}

impl TypeSpec {
    /// Parses `str`, `list[path]`, `int | str`, `str?`, `optional[int]`...
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty type".to_string());
        }

        let alternatives = split_top_level(text, '|');
        if alternatives.len() > 1 {
            let parts = alternatives
                .iter()
                .map(|alt| Self::parse(alt))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self::Union(parts));
        }

        if let Some(inner) = text.strip_suffix('?') {
            return Ok(Self::Optional(Box::new(Self::parse(inner)?)));
        }

        if let Some((head, rest)) = text.split_once('[') {
            let inner = rest
                .strip_suffix(']')
                .ok_or_else(|| format!("unclosed '[' in type '{}'", text))?;
            let inner = Box::new(Self::parse(inner)?);
            return match head.trim() {
                "list" => Ok(Self::List(inner)),
                "dict" => Ok(Self::Dict(inner)),
                "optional" => Ok(Self::Optional(inner)),
                other => Err(format!("unknown generic type '{}'", other)),
            };
        }

        match text {
            "str" => Ok(Self::Str),
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "bool" => Ok(Self::Bool),
            "path" => Ok(Self::Path),
            "any" => Ok(Self::Any),
            other => Err(format!("unknown type '{}'", other)),
        }
    }

    pub fn is_nullable(&self) -> bool {
        match self {
            Self::Optional(_) | Self::Any => true,
            Self::Union(parts) => parts.iter().any(Self::is_nullable),
            _ => false,
        }
    }

    /// Structural assignability check.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _) => true,
            (Self::Optional(_), Value::Null) => true,
            (Self::Optional(inner), value) => inner.accepts(value),
            (Self::Union(parts), value) => parts.iter().any(|p| p.accepts(value)),
            (Self::Str | Self::Path, Value::Str(_)) => true,
            (Self::Int, Value::Int(_)) => true,
            (Self::Float, Value::Float(_) | Value::Int(_)) => true,
            (Self::Bool, Value::Bool(_)) => true,
            (Self::List(inner), Value::List(items)) => items.iter().all(|i| inner.accepts(i)),
            (Self::Dict(inner), Value::Dict(dict)) => dict.snapshot().iter().all(|(_, v)| inner.accepts(v)),
            _ => false,
        }
    }

    /// Expands `path`-typed strings (`~`, `$VAR`) and anchors relative ones at `root`.
    pub fn coerce(&self, value: Value, root: &Path) -> Value {
        match (self, value) {
            (Self::Path, Value::Str(s)) => Value::Str(expand_path(&s, root)),
            (Self::Optional(inner), value) => inner.coerce(value, root),
            (Self::List(inner), Value::List(items)) if inner.mentions_path() => Value::list(
                items.iter().map(|i| inner.coerce(i.clone(), root)).collect(),
            ),
            (Self::Union(parts), Value::Str(s))
                if parts.contains(&Self::Path) && !parts.contains(&Self::Str) =>
            {
                Value::Str(expand_path(&s, root))
            }
            (_, value) => value,
        }
    }

    fn mentions_path(&self) -> bool {
        match self {
            Self::Path => true,
            Self::Optional(inner) | Self::List(inner) | Self::Dict(inner) => inner.mentions_path(),
            Self::Union(parts) => parts.iter().any(Self::mentions_path),
            _ => false,
        }
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str => write!(f, "str"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Bool => write!(f, "bool"),
            Self::Path => write!(f, "path"),
            Self::Any => write!(f, "any"),
            Self::List(inner) => write!(f, "list[{}]", inner),
            Self::Dict(inner) => write!(f, "dict[{}]", inner),
            Self::Optional(inner) => write!(f, "{}?", inner),
            Self::Union(parts) => {
                let parts: Vec<String> = parts.iter().map(ToString::to_string).collect();
                write!(f, "{}", parts.join(" | "))
            }
        }
    }
}

/// Splits on `sep` outside of brackets.
fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                parts.push(text.get(start..i).unwrap_or_default());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(text.get(start..).unwrap_or_default());
    parts
}

/// Expands `~` and environment variables; relative results are joined to `root`.
pub fn expand_path(raw: &str, root: &Path) -> String {
    let expanded = shellexpand::full(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    let path = Path::new(&expanded);
    if path.is_absolute() {
        expanded
    } else {
        root.join(path).to_string_lossy().into_owned()
    }
}
