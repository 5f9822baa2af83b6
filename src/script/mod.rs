//! # Script Runtime
//!
//! A small embedded language for user code that must survive live reloads.
//! Project source modules (`*.stm`) and the expression bodies of definition
//! files (computed variables, commands, hooks, contexts) are both evaluated
//! here.
//!
//! Runtime objects (modules, classes, dictionaries, functions) are shared
//! through `Arc` and mutated in place, which is what lets the partial
//! reloader swap a function's code or a variable's value while every holder
//! of the object keeps a valid reference.
//!
//! ## Modules
//!
//! - **`parser`** / **`ast`**: source text to [`ast::Program`], through the
//!   pest grammar in `stm.pest`.
//! - **`value`**: the runtime object model.
//! - **`interp`**: expression evaluation and module execution.
//! - **`builtins`**: native functions available to every scope, and the
//!   [`ScriptHost`] session they run against.
//! - **`registry`**: the module cache and import procedure.

use thiserror::Error;

pub mod ast;
pub mod builtins;
pub mod interp;
pub mod parser;
pub mod registry;
pub mod value;

pub use builtins::ScriptHost;
pub use registry::ModuleRegistry;
pub use value::{ClassObj, Code, DictObj, FunctionObj, ModuleObj, Value};

/// File extension of script modules.
pub const MODULE_EXTENSION: &str = "stm";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("{origin}:{line}: syntax error: {message}")]
    Syntax {
        origin: String,
        line: usize,
        message: String,
    },
    #[error("name '{0}' is not defined")]
    Name(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("{callee}() takes {expected} argument(s) but {got} were given")]
    Arity {
        callee: String,
        expected: usize,
        got: usize,
    },
    #[error("cannot import '{module}': {reason}")]
    Import { module: String, reason: String },
    #[error("'{object}' has no attribute '{attr}'")]
    Attribute { object: String, attr: String },
    #[error("key {0} not found")]
    Key(String),
    #[error("maximum call depth ({0}) exceeded")]
    Recursion(usize),
    #[error("{0}")]
    Runtime(String),
}
