// src/script/interp.rs

use super::{
    ScriptError, ScriptHost, builtins,
    ast::{BinOp, ClassDef, Expr, FnDef, Program, StmtKind, TemplatePart, UnaryOp},
    value::{ClassObj, Code, DictObj, FunctionObj, ModuleObj, Value},
};
use std::{
    cell::Cell,
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

const MAX_CALL_DEPTH: usize = 64;

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// The import procedure used while executing a module body.
///
/// `parent` is the name of the module whose body is executing, or `None` for
/// synthetic scopes that should not be tracked as importers.
pub trait Importer {
    fn import(&self, name: &str, parent: Option<&str>) -> Result<Arc<ModuleObj>, ScriptError>;

    /// Session seen by builtins called while a module body executes.
    fn host(&self) -> Option<Arc<ScriptHost>> {
        None
    }
}

/// Name resolution context: locals, then module globals, then builtins.
#[derive(Debug, Default)]
pub struct Scope {
    locals: HashMap<String, Value>,
    module: Option<Arc<ModuleObj>>,
    host: Option<Arc<ScriptHost>>,
}

impl Scope {
    pub fn new(module: Option<Arc<ModuleObj>>) -> Self {
        Self {
            locals: HashMap::new(),
            module,
            host: None,
        }
    }

    /// Without a host, builtins see the current process.
    pub fn with_host(mut self, host: Option<Arc<ScriptHost>>) -> Self {
        self.host = host;
        self
    }

    pub fn with_local(mut self, name: impl Into<String>, value: Value) -> Self {
        self.locals.insert(name.into(), value);
        self
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    fn lookup(&self, name: &str) -> Result<Value, ScriptError> {
        if let Some(value) = self.locals.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.module.as_ref().and_then(|m| m.get(name)) {
            return Ok(value);
        }
        builtins::lookup(name)
            .map(Value::Builtin)
            .ok_or_else(|| ScriptError::Name(name.to_string()))
    }
}

// --- Expressions ---

pub fn eval(expr: &Expr, scope: &Scope) -> Result<Value, ScriptError> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(i) => Ok(Value::Int(*i)),
        Expr::Float(f) => Ok(Value::Float(*f)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Template(parts) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    TemplatePart::Literal(text) => out.push_str(text),
                    TemplatePart::Expr(expr) => out.push_str(&eval(expr, scope)?.to_string()),
                }
            }
            Ok(Value::Str(out))
        }
        Expr::List(items) => {
            let values = items
                .iter()
                .map(|item| eval(item, scope))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::list(values))
        }
        Expr::Dict(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                let key = match eval(key, scope)? {
                    Value::Str(s) => s,
                    other => other.to_string(),
                };
                map.insert(key, eval(value, scope)?);
            }
            Ok(Value::Dict(Arc::new(DictObj::from_map(map))))
        }
        Expr::Name(name) => scope.lookup(name),
        Expr::Attr(target, attr) => get_attr(&eval(target, scope)?, attr),
        Expr::Index(target, index) => get_index(&eval(target, scope)?, &eval(index, scope)?),
        Expr::Call(callee, args) => {
            let callee = eval(callee, scope)?;
            let args = args
                .iter()
                .map(|arg| eval(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call_value(&callee, args, scope.host.as_ref())
        }
        Expr::Unary(op, operand) => {
            let value = eval(operand, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                UnaryOp::Neg => match value {
                    Value::Int(i) => i
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| ScriptError::Runtime("integer overflow".to_string())),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(ScriptError::Type(format!(
                        "bad operand for unary -: {}",
                        other.type_name()
                    ))),
                },
            }
        }
        Expr::Binary(BinOp::And, left, right) => {
            let left = eval(left, scope)?;
            if !left.truthy() {
                return Ok(left);
            }
            eval(right, scope)
        }
        Expr::Binary(BinOp::Or, left, right) => {
            let left = eval(left, scope)?;
            if left.truthy() {
                return Ok(left);
            }
            eval(right, scope)
        }
        Expr::Binary(op, left, right) => binary(*op, eval(left, scope)?, eval(right, scope)?),
        Expr::Conditional {
            cond,
            then,
            otherwise,
        } => {
            if eval(cond, scope)?.truthy() {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
    }
}

fn get_attr(target: &Value, attr: &str) -> Result<Value, ScriptError> {
    let found = match target {
        Value::Module(module) => module.get(attr),
        Value::Class(class) => class.get(attr),
        Value::Dict(dict) => dict.get(attr),
        _ => None,
    };
    found.ok_or_else(|| ScriptError::Attribute {
        object: target.to_string(),
        attr: attr.to_string(),
    })
}

fn get_index(target: &Value, index: &Value) -> Result<Value, ScriptError> {
    match (target, index) {
        (Value::List(items), Value::Int(i)) => {
            let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
            let position = if *i < 0 { len + *i } else { *i };
            usize::try_from(position)
                .ok()
                .and_then(|p| items.get(p).cloned())
                .ok_or_else(|| ScriptError::Key(i.to_string()))
        }
        (Value::Dict(dict), Value::Str(key)) => {
            dict.get(key).ok_or_else(|| ScriptError::Key(format!("'{}'", key)))
        }
        (Value::Str(s), Value::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|p| s.chars().nth(p))
            .map(|c| Value::Str(c.to_string()))
            .ok_or_else(|| ScriptError::Key(i.to_string())),
        (target, index) => Err(ScriptError::Type(format!(
            "{} cannot be indexed by {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn binary(op: BinOp, left: Value, right: Value) -> Result<Value, ScriptError> {
    let overflow = || ScriptError::Runtime("integer overflow".to_string());
    let mismatch = |left: &Value, right: &Value| {
        ScriptError::Type(format!(
            "unsupported operand types for {:?}: {} and {}",
            op,
            left.type_name(),
            right.type_name()
        ))
    };

    match op {
        BinOp::Eq => return Ok(Value::Bool(left.same_value(&right))),
        BinOp::NotEq => return Ok(Value::Bool(!left.same_value(&right))),
        BinOp::Lt | BinOp::Gt | BinOp::LtEq | BinOp::GtEq => {
            let ordering = match (&left, &right) {
                (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
                (a, b) => match (as_float(a), as_float(b)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => return Err(mismatch(&left, &right)),
                },
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::LtEq => ordering.is_le(),
                _ => ordering.is_ge(),
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    match (op, &left, &right) {
        (BinOp::Add, Value::Int(a), Value::Int(b)) => a.checked_add(*b).map(Value::Int).ok_or_else(overflow),
        (BinOp::Sub, Value::Int(a), Value::Int(b)) => a.checked_sub(*b).map(Value::Int).ok_or_else(overflow),
        (BinOp::Mul, Value::Int(a), Value::Int(b)) => a.checked_mul(*b).map(Value::Int).ok_or_else(overflow),
        (BinOp::Rem, Value::Int(_), Value::Int(0)) => Err(ScriptError::DivisionByZero),
        (BinOp::Rem, Value::Int(a), Value::Int(b)) => {
            a.checked_rem_euclid(*b).map(Value::Int).ok_or_else(overflow)
        }
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.as_ref().clone();
            items.extend(b.iter().cloned());
            Ok(Value::list(items))
        }
        (BinOp::Mul, Value::Str(s), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(s)) => {
            builtins::repeat(s, *n).map(Value::Str)
        }
        (BinOp::Div, a, b) => match (as_float(a), as_float(b)) {
            (Some(_), Some(divisor)) if divisor == 0.0 => Err(ScriptError::DivisionByZero),
            (Some(a), Some(b)) => Ok(Value::Float(a / b)),
            _ => Err(mismatch(&left, &right)),
        },
        (op, a, b) => match (as_float(a), as_float(b)) {
            (Some(a), Some(b)) => match op {
                BinOp::Add => Ok(Value::Float(a + b)),
                BinOp::Sub => Ok(Value::Float(a - b)),
                BinOp::Mul => Ok(Value::Float(a * b)),
                BinOp::Rem if b == 0.0 => Err(ScriptError::DivisionByZero),
                BinOp::Rem => Ok(Value::Float(a.rem_euclid(b))),
                _ => Err(mismatch(&left, &right)),
            },
            _ => Err(mismatch(&left, &right)),
        },
    }
}

/// Calls a function, builtin or class-level callable with positional args.
pub fn call_value(
    callee: &Value,
    args: Vec<Value>,
    host: Option<&Arc<ScriptHost>>,
) -> Result<Value, ScriptError> {
    match callee {
        Value::Builtin(builtin) => match host {
            Some(host) => (builtin.func)(host, &args),
            None => (builtin.func)(&ScriptHost::from_process(), &args),
        },
        Value::Func(func) => call_function(func, args, host),
        other => Err(ScriptError::Type(format!("'{}' is not callable", other))),
    }
}

pub fn call_function(
    func: &FunctionObj,
    args: Vec<Value>,
    host: Option<&Arc<ScriptHost>>,
) -> Result<Value, ScriptError> {
    let code = func.code();
    if code.params.len() != args.len() {
        return Err(ScriptError::Arity {
            callee: func.qualname.clone(),
            expected: code.params.len(),
            got: args.len(),
        });
    }

    let depth = CALL_DEPTH.with(|d| {
        let next = d.get() + 1;
        d.set(next);
        next
    });
    let _guard = scopeguard::guard((), |_| CALL_DEPTH.with(|d| d.set(d.get().saturating_sub(1))));
    if depth > MAX_CALL_DEPTH {
        return Err(ScriptError::Recursion(MAX_CALL_DEPTH));
    }

    let mut scope = Scope::new(func.module()).with_host(host.cloned());
    for (param, arg) in code.params.iter().zip(args) {
        scope.bind(param.clone(), arg);
    }
    eval(&code.body, &scope)
}

// --- Statements ---

fn make_code(def: &FnDef) -> Code {
    Code {
        params: def.params.clone(),
        body: def.body.clone(),
        first_line: def.line,
        end_line: def.end_line,
        source: def.source.clone(),
    }
}

fn build_class(
    def: &ClassDef,
    prefix: &str,
    module: &Arc<ModuleObj>,
    host: &Option<Arc<ScriptHost>>,
) -> Result<Arc<ClassObj>, ScriptError> {
    let qualname = if prefix.is_empty() {
        def.name.clone()
    } else {
        format!("{}.{}", prefix, def.name)
    };
    let class = Arc::new(ClassObj::new(
        def.name.clone(),
        module.name.clone(),
        def.source.clone(),
    ));
    let scope = Scope::new(Some(Arc::clone(module))).with_host(host.clone());

    for member in &def.members {
        match &member.kind {
            StmtKind::Assign { name, value } => class.set(name.clone(), eval(value, &scope)?),
            StmtKind::Fn(fn_def) => {
                let func = FunctionObj::new(
                    fn_def.name.clone(),
                    format!("{}.{}", qualname, fn_def.name),
                    module,
                    make_code(fn_def),
                );
                class.set(fn_def.name.clone(), Value::Func(Arc::new(func)));
            }
            StmtKind::Class(inner) => {
                let nested = build_class(inner, &qualname, module, host)?;
                class.set(inner.name.clone(), Value::Class(nested));
            }
            _ => {}
        }
    }
    Ok(class)
}

/// Executes a module body, binding its top-level names into `module`.
pub fn exec_module(
    program: &Program,
    module: &Arc<ModuleObj>,
    importer: &dyn Importer,
    track_as: Option<&str>,
) -> Result<(), ScriptError> {
    let host = importer.host();
    let scope = Scope::new(Some(Arc::clone(module))).with_host(host.clone());

    for stmt in &program.statements {
        match &stmt.kind {
            StmtKind::Import { module: name, alias } => {
                let imported = importer.import(name, track_as)?;
                let binding = alias
                    .clone()
                    .unwrap_or_else(|| name.rsplit('.').next().unwrap_or(name).to_string());
                module.set(binding, Value::Module(imported));
            }
            StmtKind::FromImport { module: name, names } => {
                let imported = importer.import(name, track_as)?;
                for symbol in names {
                    let value = imported.get(symbol).ok_or_else(|| ScriptError::Import {
                        module: name.clone(),
                        reason: format!("module has no name '{}'", symbol),
                    })?;
                    module.set(symbol.clone(), value);
                }
            }
            StmtKind::Assign { name, value } => {
                let value = eval(value, &scope)?;
                module.set(name.clone(), value);
            }
            StmtKind::Fn(def) => {
                let func = FunctionObj::new(def.name.clone(), def.name.clone(), module, make_code(def));
                module.set(def.name.clone(), Value::Func(Arc::new(func)));
            }
            StmtKind::Class(def) => {
                let class = build_class(def, "", module, &host)?;
                module.set(def.name.clone(), Value::Class(class));
            }
            StmtKind::Expr(expr) => {
                eval(expr, &scope)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::{parse_expr, parse_program};

    struct NoImports;

    impl Importer for NoImports {
        fn import(&self, name: &str, _parent: Option<&str>) -> Result<Arc<ModuleObj>, ScriptError> {
            Err(ScriptError::Import {
                module: name.to_string(),
                reason: "imports disabled".to_string(),
            })
        }
    }

    fn run(source: &str) -> Arc<ModuleObj> {
        let module = Arc::new(ModuleObj::new("m", None, source));
        let program = parse_program(source, "m").unwrap();
        exec_module(&program, &module, &NoImports, Some("m")).unwrap();
        module
    }

    fn eval_str(source: &str) -> Result<Value, ScriptError> {
        eval(&parse_expr(source, "e").unwrap(), &Scope::default())
    }

    #[test]
    fn test_function_call_with_template() {
        let module = run("fn fun(a, b) = \"{a}_{b}\"\nresult = fun(\"x\", \"y\")\n");
        assert_eq!(module.get("result").unwrap().to_string(), "x_y");
    }

    #[test]
    fn test_true_division_yields_float() {
        let value = eval_str("6 / 3").unwrap();
        assert!(matches!(value, Value::Float(f) if f == 2.0));
        assert!(value.same_value(&Value::Int(2)));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(eval_str("1 / 0").unwrap_err(), ScriptError::DivisionByZero);
    }

    #[test]
    fn test_function_resolves_globals_at_call_time() {
        let module = run("n = 1\nfn get() = n\n");
        let Value::Func(func) = module.get("get").unwrap() else {
            unreachable!("expected function");
        };
        module.set("n", Value::Int(5));
        assert!(call_function(&func, vec![], None).unwrap().same_value(&Value::Int(5)));
    }

    #[test]
    fn test_class_methods_have_qualified_names() {
        let module = run("class Car {\n  wheels = 4\n  fn honk(n) = \"beep\" * n\n}\n");
        let Value::Class(class) = module.get("Car").unwrap() else {
            unreachable!("expected class");
        };
        let Value::Func(honk) = class.get("honk").unwrap() else {
            unreachable!("expected method");
        };
        assert_eq!(honk.qualname, "Car.honk");
        assert_eq!(call_function(&honk, vec![Value::Int(2)], None).unwrap().to_string(), "beepbeep");
    }

    #[test]
    fn test_arity_mismatch() {
        let module = run("fn one(a) = a\n");
        let Value::Func(one) = module.get("one").unwrap() else {
            unreachable!("expected function");
        };
        assert!(matches!(
            call_function(&one, vec![], None),
            Err(ScriptError::Arity { expected: 1, got: 0, .. })
        ));
    }

    #[test]
    fn test_unbounded_recursion_is_stopped() {
        let module = run("fn loop(n) = loop(n)\n");
        let Value::Func(looping) = module.get("loop").unwrap() else {
            unreachable!("expected function");
        };
        assert!(matches!(
            call_function(&looping, vec![Value::Int(1)], None),
            Err(ScriptError::Recursion(_))
        ));
    }

    #[test]
    fn test_short_circuit_and_conditional() {
        assert_eq!(eval_str("null or \"fallback\"").unwrap().to_string(), "fallback");
        assert_eq!(eval_str("\"a\" if 1 > 2 else \"b\"").unwrap().to_string(), "b");
        assert!(eval_str("false and (1 / 0)").is_ok());
    }

    #[test]
    fn test_dict_attribute_and_index_access() {
        let module = run("colors = {\"red\": \"#f00\"}\nx = colors.red\ny = colors[\"red\"]\n");
        assert_eq!(module.get("x").unwrap().to_string(), "#f00");
        assert_eq!(module.get("y").unwrap().to_string(), "#f00");
    }

    #[test]
    fn test_integer_remainder_overflow_is_an_error() {
        assert!(eval_str("-7 % 3").unwrap().same_value(&Value::Int(2)));
        assert!(matches!(
            eval_str("(-9223372036854775807 - 1) % -1"),
            Err(ScriptError::Runtime(_))
        ));
    }

    #[test]
    fn test_string_repetition_is_bounded() {
        assert_eq!(eval_str("\"ab\" * 3").unwrap().to_string(), "ababab");
        assert!(matches!(eval_str("\"ab\" * 9223372036854775807"), Err(ScriptError::Runtime(_))));
        assert!(matches!(eval_str("\"x\" * 100000000"), Err(ScriptError::Runtime(_))));
    }

    #[test]
    fn test_builtins_see_the_scope_host() {
        let host = ScriptHost {
            env: HashMap::from([("SANDBOX_PORT".to_string(), "8000".to_string())]),
            ..ScriptHost::from_process()
        };
        let scope = Scope::default().with_host(Some(Arc::new(host)));
        let value = eval(&parse_expr("getenv(\"SANDBOX_PORT\")", "e").unwrap(), &scope).unwrap();
        assert_eq!(value.to_string(), "8000");
    }
}
