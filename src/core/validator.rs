// src/core/validator.rs

use super::{
    composer::{ComposedEnv, MagicRegistry},
    magic::MagicFunction,
    tree::EnvTree,
};
use crate::script::ScriptError;
use std::{collections::BTreeMap, fmt, path::PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("NoValueError: '{name}' has no value (declared in '{}')", origin.display())]
    NoValue { name: String, origin: PathBuf },
    #[error("NoTypeError: '{name}' has no type (declared in '{}')", origin.display())]
    NoType { name: String, origin: PathBuf },
    #[error("WrongTypeError: '{name}' expects {expected}, {found}")]
    WrongType {
        name: String,
        expected: String,
        found: String,
    },
    #[error("RedefinedVarError(\"{key}\"): projected by {}", names.join(", "))]
    RedefinedVar { key: String, names: Vec<String> },
    #[error("ComputedVarError: '{name}' could not be computed: {source}")]
    ComputedVar {
        name: String,
        #[source]
        source: ScriptError,
    },
    #[error(
        "MagicSignatureError: {location} expects parameters ({}), got ({})",
        expected.join(", "),
        got.join(", ")
    )]
    MagicSignature {
        location: String,
        expected: Vec<String>,
        got: Vec<String>,
    },
}

/// Every problem found in one environment, reported as one message.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Environment is invalid ({} error(s)):", self.0.len())?;
        for error in &self.0 {
            writeln!(f, "  - {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Checks a composed environment. An empty list means it may be activated.
pub fn validate(env: &ComposedEnv) -> Vec<ValidationError> {
    let mut errors = validate_tree(&env.tree);
    errors.extend(validate_magic(&env.magic));
    errors
}

/// Wraps [`validate`] into a `Result` for callers that stop at the first failure.
pub fn ensure_valid(env: &ComposedEnv) -> Result<(), ValidationErrors> {
    let errors = validate(env);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

pub fn validate_tree(tree: &EnvTree) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for leaf in tree.leaves() {
        let name = leaf.full_name(&tree.name);

        let spec = match leaf.type_spec() {
            None => {
                errors.push(ValidationError::NoType {
                    name: name.clone(),
                    origin: leaf.origin.clone(),
                });
                None
            }
            Some(Err(reason)) => {
                errors.push(ValidationError::WrongType {
                    name: name.clone(),
                    expected: leaf.type_decl.clone().unwrap_or_default(),
                    found: reason,
                });
                None
            }
            Some(Ok(spec)) => Some(spec),
        };

        let value = match tree.read(leaf) {
            Ok(value) => value,
            Err(source) => {
                errors.push(ValidationError::ComputedVar { name, source });
                continue;
            }
        };

        match (value, spec) {
            (None, spec) => {
                let nullable = leaf.optional || spec.as_ref().is_some_and(|s| s.is_nullable());
                if !nullable {
                    errors.push(ValidationError::NoValue {
                        name,
                        origin: leaf.origin.clone(),
                    });
                }
            }
            (Some(value), Some(spec)) if !spec.accepts(&value) => {
                errors.push(ValidationError::WrongType {
                    name,
                    expected: spec.to_string(),
                    found: format!("got {} {}", value.type_name(), value.repr()),
                });
            }
            _ => {}
        }
    }

    let mut by_key: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for leaf in tree.leaves() {
        by_key
            .entry(leaf.exported_key(&tree.name))
            .or_default()
            .push(format!("{}.{}", tree.name, leaf.relative_name()));
    }
    for (key, names) in by_key {
        if names.len() > 1 {
            errors.push(ValidationError::RedefinedVar { key, names });
        }
    }

    errors
}

pub fn validate_magic(magic: &MagicRegistry) -> Vec<ValidationError> {
    magic.iter().filter_map(check_signature).collect()
}

/// Hooks must take exactly their kind's parameter names, in any order.
fn check_signature(function: &MagicFunction) -> Option<ValidationError> {
    let expected = function.kind.expected_params()?;
    let mut want: Vec<String> = expected.iter().map(|p| p.to_string()).collect();
    let mut got = function.params.clone();
    want.sort();
    got.sort();
    if want == got {
        return None;
    }
    Some(ValidationError::MagicSignature {
        location: function.location(),
        expected: expected.iter().map(|p| p.to_string()).collect(),
        got: function.params.clone(),
    })
}
