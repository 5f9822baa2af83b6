// src/script/value.rs

use super::{ScriptError, ScriptHost, ast::Expr};
use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    sync::{Arc, RwLock, Weak},
};

/// Signature of a native builtin function.
pub type BuiltinFn = fn(&ScriptHost, &[Value]) -> Result<Value, ScriptError>;

/// A native function exposed to scripts.
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<builtin {}>", self.name)
    }
}

/// A dynamically typed script value.
///
/// Containers and callables are shared by reference; cloning a `Value` never
/// copies a dictionary, class, function or module.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Arc<Vec<Value>>),
    Dict(Arc<DictObj>),
    Func(Arc<FunctionObj>),
    Builtin(Builtin),
    Class(Arc<ClassObj>),
    Module(Arc<ModuleObj>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Arc::new(items))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Func(_) => "function",
            Self::Builtin(_) => "builtin",
            Self::Class(_) => "class",
            Self::Module(_) => "module",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Dict(dict) => !dict.is_empty(),
            _ => true,
        }
    }

    /// Value equality as used by the reloader: data is compared structurally,
    /// shared objects by identity.
    pub fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same_value(y))
            }
            (Self::Dict(a), Self::Dict(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.snapshot();
                let b = b.snapshot();
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same_value(vb))
            }
            (Self::Func(a), Self::Func(b)) => Arc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => a.name == b.name,
            (Self::Class(a), Self::Class(b)) => Arc::ptr_eq(a, b),
            (Self::Module(a), Self::Module(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Address of the shared object, if this value is one. Used for identity
    /// checks and cycle guards.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Self::Dict(d) => Some(Arc::as_ptr(d) as usize),
            Self::Func(f) => Some(Arc::as_ptr(f) as usize),
            Self::Class(c) => Some(Arc::as_ptr(c) as usize),
            Self::Module(m) => Some(Arc::as_ptr(m) as usize),
            _ => None,
        }
    }

    /// Re-homes functions reachable from this value into `module`, so that a
    /// definition created in a throwaway module resolves globals in the live one.
    /// Objects owned by other modules are left alone.
    pub fn rehome(&self, module: &Arc<ModuleObj>) {
        match self {
            Self::Func(func) if func.module_name() == module.name => func.set_module(module),
            Self::Class(class) if class.module_name() == module.name => {
                class.set_module_name(&module.name);
                for (_, member) in class.snapshot() {
                    member.rehome(module);
                }
            }
            Self::Dict(dict) => {
                for (_, item) in dict.snapshot() {
                    item.rehome(module);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Self::Str(s) => write!(f, "{}", s),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.repr())?;
                }
                write!(f, "]")
            }
            Self::Dict(dict) => {
                write!(f, "{{")?;
                for (i, (key, value)) in dict.snapshot().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", key, value.repr())?;
                }
                write!(f, "}}")
            }
            Self::Func(func) => write!(f, "<fn {}>", func.qualname),
            Self::Builtin(b) => write!(f, "<builtin {}>", b.name),
            Self::Class(class) => write!(f, "<class {}>", class.name),
            Self::Module(module) => write!(f, "<module {}>", module.name),
        }
    }
}

impl Value {
    /// Display form with strings quoted, used inside containers.
    pub fn repr(&self) -> String {
        match self {
            Self::Str(s) => format!("\"{}\"", s),
            other => other.to_string(),
        }
    }
}

impl From<toml::Value> for Value {
    fn from(value: toml::Value) -> Self {
        match value {
            toml::Value::String(s) => Self::Str(s),
            toml::Value::Integer(i) => Self::Int(i),
            toml::Value::Float(f) => Self::Float(f),
            toml::Value::Boolean(b) => Self::Bool(b),
            toml::Value::Datetime(dt) => Self::Str(dt.to_string()),
            toml::Value::Array(items) => Self::list(items.into_iter().map(Self::from).collect()),
            toml::Value::Table(table) => {
                let dict = DictObj::default();
                for (key, value) in table {
                    dict.insert(key, Self::from(value));
                }
                Self::Dict(Arc::new(dict))
            }
        }
    }
}

// --- Shared runtime objects ---

/// A mutable string-keyed dictionary.
#[derive(Debug, Default)]
pub struct DictObj {
    items: RwLock<BTreeMap<String, Value>>,
}

impl DictObj {
    pub fn from_map(items: BTreeMap<String, Value>) -> Self {
        Self {
            items: RwLock::new(items),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.items.read().ok()?.get(key).cloned()
    }

    pub fn insert(&self, key: String, value: Value) {
        if let Ok(mut items) = self.items.write() {
            items.insert(key, value);
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.items.write().ok()?.remove(key)
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A point-in-time copy of the entries, in key order.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.items
            .read()
            .map(|items| items.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

/// The executable part of a function. Swapped wholesale on reload.
#[derive(Debug, Clone, PartialEq)]
pub struct Code {
    pub params: Vec<String>,
    pub body: Expr,
    pub first_line: usize,
    pub end_line: usize,
    pub source: String,
}

impl Code {
    /// Fingerprint over everything that affects behavior or tracebacks:
    /// parameter names, the canonical body and the line table.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.params.join(",").as_bytes());
        hasher.update(b"\0");
        hasher.update(format!("{:?}", self.body).as_bytes());
        hasher.update(b"\0");
        hasher.update(format!("{}:{}", self.first_line, self.end_line).as_bytes());
        hex::encode(hasher.finalize().as_bytes().get(..16).unwrap_or_default())
    }
}

/// A user-defined function or method.
#[derive(Debug)]
pub struct FunctionObj {
    pub name: String,
    pub qualname: String,
    module_name: RwLock<String>,
    module: RwLock<Weak<ModuleObj>>,
    code: RwLock<Arc<Code>>,
}

impl FunctionObj {
    pub fn new(name: String, qualname: String, module: &Arc<ModuleObj>, code: Code) -> Self {
        Self {
            name,
            qualname,
            module_name: RwLock::new(module.name.clone()),
            module: RwLock::new(Arc::downgrade(module)),
            code: RwLock::new(Arc::new(code)),
        }
    }

    pub fn code(&self) -> Arc<Code> {
        match self.code.read() {
            Ok(code) => Arc::clone(&code),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Rebinds the function body in place; every holder of this function sees
    /// the new behavior.
    pub fn set_code(&self, code: Arc<Code>) {
        match self.code.write() {
            Ok(mut slot) => *slot = code,
            Err(poisoned) => *poisoned.into_inner() = code,
        }
    }

    pub fn module(&self) -> Option<Arc<ModuleObj>> {
        self.module.read().ok()?.upgrade()
    }

    pub fn module_name(&self) -> String {
        self.module_name.read().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn set_module(&self, module: &Arc<ModuleObj>) {
        if let Ok(mut slot) = self.module.write() {
            *slot = Arc::downgrade(module);
        }
        if let Ok(mut name) = self.module_name.write() {
            *name = module.name.clone();
        }
    }
}

/// A class: a named, mutable member table.
#[derive(Debug)]
pub struct ClassObj {
    pub name: String,
    module_name: RwLock<String>,
    pub source: String,
    members: RwLock<BTreeMap<String, Value>>,
}

impl ClassObj {
    pub fn new(name: String, module_name: String, source: String) -> Self {
        Self {
            name,
            module_name: RwLock::new(module_name),
            source,
            members: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn module_name(&self) -> String {
        self.module_name.read().map(|n| n.clone()).unwrap_or_default()
    }

    fn set_module_name(&self, name: &str) {
        if let Ok(mut slot) = self.module_name.write() {
            *slot = name.to_string();
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.members.read().ok()?.get(key).cloned()
    }

    pub fn set(&self, key: String, value: Value) {
        if let Ok(mut members) = self.members.write() {
            members.insert(key, value);
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.members.write().ok()?.remove(key)
    }

    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.members
            .read()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

/// A loaded script module.
#[derive(Debug)]
pub struct ModuleObj {
    pub name: String,
    /// Backing file; `None` for synthetic modules (definition scopes).
    pub path: Option<PathBuf>,
    pub source: String,
    globals: RwLock<BTreeMap<String, Value>>,
}

impl ModuleObj {
    pub fn new(name: impl Into<String>, path: Option<PathBuf>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path,
            source: source.into(),
            globals: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.globals.read().ok()?.get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        if let Ok(mut globals) = self.globals.write() {
            globals.insert(key.into(), value);
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.globals.write().ok()?.remove(key)
    }

    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.globals
            .read()
            .map(|g| g.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}
