//! Fuel- and deadline-bounded evaluator.
//!
//! Every expression step costs fuel; host calls cost more. Exceeding either
//! the fuel budget or the wall-clock deadline aborts evaluation with
//! [`EvalError::Budget`], which upstream maps to a contract denial or an
//! invoke fault. The evaluator is synchronous and never suspends: it runs
//! entirely inside the kernel's apply.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use thiserror::Error;

use crate::lang::parser::{parse_program, Expr};
use crate::lang::value::{Lambda, Scope, Value};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("undefined symbol {0}")]
    Undefined(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("arity error: {0}")]
    Arity(String),
    #[error("budget exceeded: {0}")]
    Budget(String),
    #[error("host error: {0}")]
    Host(String),
}

/// Bridge from evaluated code to the kernel facade. Symbols with a
/// namespace separator (`kernel/balance`, `kernel/transfer-scrip`, ...)
/// dispatch here.
pub trait LangHost {
    fn host_call(&mut self, name: &str, args: &[Value]) -> Result<Value, EvalError>;
}

/// Host that denies every call; used where code must stay pure.
pub struct NoHost;

impl LangHost for NoHost {
    fn host_call(&mut self, name: &str, _args: &[Value]) -> Result<Value, EvalError> {
        Err(EvalError::Host(format!("host call {} not permitted here", name)))
    }
}

/// Evaluation limits. `max_fuel` bounds steps, `deadline` bounds wall time.
#[derive(Debug, Clone, Copy)]
pub struct EvalBudget {
    pub max_fuel: u64,
    pub deadline_ms: u64,
}

impl Default for EvalBudget {
    fn default() -> Self {
        Self {
            max_fuel: 100_000,
            deadline_ms: 100,
        }
    }
}

/// Result of a bounded evaluation; `fuel_used` feeds invoke pricing.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub value: Value,
    pub fuel_used: u64,
}

const HOST_CALL_FUEL: u64 = 25;
const DEADLINE_CHECK_MASK: u64 = 0x3f;

pub struct Evaluator<'h> {
    host: &'h mut dyn LangHost,
    max_fuel: u64,
    fuel_used: u64,
    started: Instant,
    deadline_ms: u64,
}

impl<'h> Evaluator<'h> {
    pub fn new(host: &'h mut dyn LangHost, budget: EvalBudget) -> Self {
        Self {
            host,
            max_fuel: budget.max_fuel,
            fuel_used: 0,
            started: Instant::now(),
            deadline_ms: budget.deadline_ms,
        }
    }

    pub fn fuel_used(&self) -> u64 {
        self.fuel_used
    }

    fn burn(&mut self, fuel: u64) -> Result<(), EvalError> {
        self.fuel_used += fuel;
        if self.fuel_used > self.max_fuel {
            return Err(EvalError::Budget(format!(
                "fuel limit {} exceeded",
                self.max_fuel
            )));
        }
        if self.fuel_used & DEADLINE_CHECK_MASK == 0
            && self.started.elapsed().as_millis() as u64 > self.deadline_ms
        {
            return Err(EvalError::Budget(format!(
                "deadline {} ms exceeded",
                self.deadline_ms
            )));
        }
        Ok(())
    }

    pub fn eval(&mut self, expr: &Expr, scope: &Rc<Scope>) -> Result<Value, EvalError> {
        self.burn(1)?;
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Symbol(name) => scope
                .lookup(name)
                .ok_or_else(|| EvalError::Undefined(name.clone())),
            Expr::Vector(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, scope)?);
                }
                Ok(Value::Vector(out))
            }
            Expr::MapLit(pairs) => {
                let mut out = BTreeMap::new();
                for (k, v) in pairs {
                    let key = match self.eval(k, scope)? {
                        Value::Keyword(name) => name,
                        Value::Str(s) => s,
                        other => {
                            return Err(EvalError::Type(format!(
                                "map key must be keyword or string, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    out.insert(key, self.eval(v, scope)?);
                }
                Ok(Value::Map(out))
            }
            Expr::List(items) => self.eval_list(items, scope),
        }
    }

    fn eval_list(&mut self, items: &[Expr], scope: &Rc<Scope>) -> Result<Value, EvalError> {
        let Some(head) = items.first() else {
            return Ok(Value::Nil);
        };
        if let Expr::Symbol(name) = head {
            match name.as_str() {
                "if" => return self.form_if(&items[1..], scope),
                "let" => return self.form_let(&items[1..], scope),
                "do" => return self.form_do(&items[1..], scope),
                "fn" => return self.form_fn(&items[1..], scope),
                "quote" => {
                    return items
                        .get(1)
                        .map(quote_expr)
                        .transpose()?
                        .ok_or_else(|| EvalError::Arity("quote needs one form".into()))
                }
                "and" => {
                    let mut last = Value::Bool(true);
                    for item in &items[1..] {
                        last = self.eval(item, scope)?;
                        if !last.truthy() {
                            return Ok(last);
                        }
                    }
                    return Ok(last);
                }
                "or" => {
                    for item in &items[1..] {
                        let value = self.eval(item, scope)?;
                        if value.truthy() {
                            return Ok(value);
                        }
                    }
                    return Ok(Value::Nil);
                }
                _ => {}
            }
        }

        // Function application: evaluate head and arguments left to right.
        let head_value = match head {
            Expr::Symbol(name) if scope.lookup(name).is_none() => None,
            other => Some(self.eval(other, scope)?),
        };
        let mut args = Vec::with_capacity(items.len().saturating_sub(1));
        for item in &items[1..] {
            args.push(self.eval(item, scope)?);
        }
        match head_value {
            Some(Value::Fn(lambda)) => self.apply(&lambda, args),
            Some(other) => Err(EvalError::Type(format!(
                "cannot call a {}",
                other.type_name()
            ))),
            None => {
                let Expr::Symbol(name) = head else {
                    unreachable!("head_value is None only for symbols")
                };
                self.call_named(name, args)
            }
        }
    }

    pub fn apply(&mut self, lambda: &Lambda, args: Vec<Value>) -> Result<Value, EvalError> {
        self.burn(1)?;
        if args.len() != lambda.params.len() {
            return Err(EvalError::Arity(format!(
                "fn expects {} args, got {}",
                lambda.params.len(),
                args.len()
            )));
        }
        let scope = Scope::child(&lambda.scope);
        for (param, arg) in lambda.params.iter().zip(args) {
            scope.define(param.clone(), arg);
        }
        let mut result = Value::Nil;
        for expr in &lambda.body {
            result = self.eval(expr, &scope)?;
        }
        Ok(result)
    }

    fn form_if(&mut self, rest: &[Expr], scope: &Rc<Scope>) -> Result<Value, EvalError> {
        if rest.len() < 2 || rest.len() > 3 {
            return Err(EvalError::Arity("if takes a test and 1-2 branches".into()));
        }
        if self.eval(&rest[0], scope)?.truthy() {
            self.eval(&rest[1], scope)
        } else if let Some(alt) = rest.get(2) {
            self.eval(alt, scope)
        } else {
            Ok(Value::Nil)
        }
    }

    fn form_let(&mut self, rest: &[Expr], scope: &Rc<Scope>) -> Result<Value, EvalError> {
        let Some(Expr::Vector(bindings)) = rest.first() else {
            return Err(EvalError::Type("let needs a binding vector".into()));
        };
        if bindings.len() % 2 != 0 {
            return Err(EvalError::Arity("let bindings must come in pairs".into()));
        }
        let scope = Scope::child(scope);
        for pair in bindings.chunks(2) {
            let Expr::Symbol(name) = &pair[0] else {
                return Err(EvalError::Type("let binds symbols only".into()));
            };
            let value = self.eval(&pair[1], &scope)?;
            scope.define(name.clone(), value);
        }
        let mut result = Value::Nil;
        for expr in &rest[1..] {
            result = self.eval(expr, &scope)?;
        }
        Ok(result)
    }

    fn form_do(&mut self, rest: &[Expr], scope: &Rc<Scope>) -> Result<Value, EvalError> {
        let mut result = Value::Nil;
        for expr in rest {
            result = self.eval(expr, scope)?;
        }
        Ok(result)
    }

    fn form_fn(&mut self, rest: &[Expr], scope: &Rc<Scope>) -> Result<Value, EvalError> {
        let Some(Expr::Vector(params)) = rest.first() else {
            return Err(EvalError::Type("fn needs a parameter vector".into()));
        };
        let mut names = Vec::with_capacity(params.len());
        for param in params {
            let Expr::Symbol(name) = param else {
                return Err(EvalError::Type("fn parameters must be symbols".into()));
            };
            names.push(name.clone());
        }
        Ok(Value::Fn(Rc::new(Lambda {
            params: names,
            body: rest[1..].to_vec(),
            scope: Rc::clone(scope),
        })))
    }

    /// Dispatch a symbol that is neither bound nor a special form: builtins
    /// first, then namespaced host calls.
    fn call_named(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        if let Some(result) = self.call_builtin(name, &args) {
            return result;
        }
        if name.len() > 1 && name.contains('/') {
            self.burn(HOST_CALL_FUEL)?;
            return self.host.host_call(name, &args);
        }
        Err(EvalError::Undefined(name.to_string()))
    }

    fn call_builtin(&mut self, name: &str, args: &[Value]) -> Option<Result<Value, EvalError>> {
        let result = match name {
            "+" => fold_numeric(args, 0, |a, b| a.checked_add(b), |a, b| a + b),
            "-" => {
                if args.len() == 1 {
                    numeric_negate(&args[0])
                } else {
                    fold_numeric(args, 1, |a, b| a.checked_sub(b), |a, b| a - b)
                }
            }
            "*" => fold_numeric(args, 0, |a, b| a.checked_mul(b), |a, b| a * b),
            "/" => divide(args),
            "=" => binary(args, |a, b| Ok(Value::Bool(a == b))),
            "not=" => binary(args, |a, b| Ok(Value::Bool(a != b))),
            "<" => compare(args, |o| o == std::cmp::Ordering::Less),
            ">" => compare(args, |o| o == std::cmp::Ordering::Greater),
            "<=" => compare(args, |o| o != std::cmp::Ordering::Greater),
            ">=" => compare(args, |o| o != std::cmp::Ordering::Less),
            "not" => unary(args, |v| Ok(Value::Bool(!v.truthy()))),
            "nil?" => unary(args, |v| Ok(Value::Bool(matches!(v, Value::Nil)))),
            "str" => Ok(Value::Str(
                args.iter()
                    .map(|v| match v {
                        Value::Str(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            )),
            "str-len" => unary(args, |v| match v {
                Value::Str(s) => Ok(Value::Int(s.len() as i64)),
                other => Err(EvalError::Type(format!(
                    "str-len wants a string, got {}",
                    other.type_name()
                ))),
            }),
            "str-contains?" => binary(args, |hay, needle| match (hay, needle) {
                (Value::Str(h), Value::Str(n)) => Ok(Value::Bool(h.contains(n))),
                _ => Err(EvalError::Type("str-contains? wants two strings".into())),
            }),
            "get" => match args {
                [collection, key] | [collection, key, _] => {
                    let fallback = args.get(2).cloned().unwrap_or(Value::Nil);
                    lookup(collection, key).map(|found| found.unwrap_or(fallback))
                }
                _ => Err(EvalError::Arity("get takes 2-3 args".into())),
            },
            "contains?" => binary(args, |collection, key| {
                lookup(collection, key).map(|found| Value::Bool(found.is_some()))
            }),
            "count" => unary(args, |v| match v {
                Value::Vector(items) => Ok(Value::Int(items.len() as i64)),
                Value::Map(m) => Ok(Value::Int(m.len() as i64)),
                Value::Str(s) => Ok(Value::Int(s.len() as i64)),
                Value::Nil => Ok(Value::Int(0)),
                other => Err(EvalError::Type(format!(
                    "count wants a collection, got {}",
                    other.type_name()
                ))),
            }),
            "first" => unary(args, |v| match v {
                Value::Vector(items) => Ok(items.first().cloned().unwrap_or(Value::Nil)),
                other => Err(EvalError::Type(format!(
                    "first wants a vector, got {}",
                    other.type_name()
                ))),
            }),
            "rest" => unary(args, |v| match v {
                Value::Vector(items) => Ok(Value::Vector(
                    items.iter().skip(1).cloned().collect(),
                )),
                other => Err(EvalError::Type(format!(
                    "rest wants a vector, got {}",
                    other.type_name()
                ))),
            }),
            "nth" => binary(args, |v, idx| match (v, idx) {
                (Value::Vector(items), Value::Int(i)) => Ok(items
                    .get(usize::try_from(*i).unwrap_or(usize::MAX))
                    .cloned()
                    .unwrap_or(Value::Nil)),
                _ => Err(EvalError::Type("nth wants a vector and an int".into())),
            }),
            "assoc" => match args {
                [Value::Map(m), key, value] => {
                    let key = match key {
                        Value::Keyword(k) => k.clone(),
                        Value::Str(s) => s.clone(),
                        other => {
                            return Some(Err(EvalError::Type(format!(
                                "assoc key must be keyword or string, got {}",
                                other.type_name()
                            ))))
                        }
                    };
                    let mut out = m.clone();
                    out.insert(key, value.clone());
                    Ok(Value::Map(out))
                }
                _ => Err(EvalError::Arity("assoc takes a map, key, value".into())),
            },
            "conj" => binary(args, |collection, item| match collection {
                Value::Vector(items) => {
                    let mut out = items.clone();
                    out.push(item.clone());
                    Ok(Value::Vector(out))
                }
                other => Err(EvalError::Type(format!(
                    "conj wants a vector, got {}",
                    other.type_name()
                ))),
            }),
            "min" => fold_ord(args, std::cmp::Ordering::Less),
            "max" => fold_ord(args, std::cmp::Ordering::Greater),
            _ => return None,
        };
        Some(result)
    }
}

fn quote_expr(expr: &Expr) -> Result<Value, EvalError> {
    Ok(match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Symbol(s) => Value::Str(s.clone()),
        Expr::Vector(items) | Expr::List(items) => Value::Vector(
            items
                .iter()
                .map(quote_expr)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Expr::MapLit(pairs) => {
            let mut out = BTreeMap::new();
            for (k, v) in pairs {
                let Value::Keyword(key) = quote_expr(k)? else {
                    return Err(EvalError::Type("quoted map keys must be keywords".into()));
                };
                out.insert(key, quote_expr(v)?);
            }
            Value::Map(out)
        }
    })
}

fn unary(
    args: &[Value],
    f: impl FnOnce(&Value) -> Result<Value, EvalError>,
) -> Result<Value, EvalError> {
    match args {
        [one] => f(one),
        _ => Err(EvalError::Arity(format!("expected 1 arg, got {}", args.len()))),
    }
}

fn binary(
    args: &[Value],
    f: impl FnOnce(&Value, &Value) -> Result<Value, EvalError>,
) -> Result<Value, EvalError> {
    match args {
        [a, b] => f(a, b),
        _ => Err(EvalError::Arity(format!("expected 2 args, got {}", args.len()))),
    }
}

fn numeric_negate(v: &Value) -> Result<Value, EvalError> {
    match v {
        Value::Int(i) => Ok(Value::Int(-i)),
        Value::Float(x) => Ok(Value::Float(-x)),
        other => Err(EvalError::Type(format!(
            "cannot negate {}",
            other.type_name()
        ))),
    }
}

fn fold_numeric(
    args: &[Value],
    min_args: usize,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    if args.len() < min_args.max(1) {
        return Err(EvalError::Arity("numeric op needs arguments".into()));
    }
    let mut acc = args[0].clone();
    for next in &args[1..] {
        acc = match (&acc, next) {
            (Value::Int(a), Value::Int(b)) => Value::Int(
                int_op(*a, *b).ok_or_else(|| EvalError::Type("integer overflow".into()))?,
            ),
            (a, b) => {
                let (a, b) = (as_f64(a)?, as_f64(b)?);
                Value::Float(float_op(a, b))
            }
        };
    }
    Ok(acc)
}

fn divide(args: &[Value]) -> Result<Value, EvalError> {
    binary(args, |a, b| match (a, b) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(EvalError::Type("division by zero".into()))
            } else {
                Ok(Value::Int(a / b))
            }
        }
        (a, b) => {
            let b = as_f64(b)?;
            if b == 0.0 {
                return Err(EvalError::Type("division by zero".into()));
            }
            Ok(Value::Float(as_f64(a)? / b))
        }
    })
}

fn as_f64(v: &Value) -> Result<f64, EvalError> {
    match v {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(x) => Ok(*x),
        other => Err(EvalError::Type(format!(
            "expected a number, got {}",
            other.type_name()
        ))),
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Result<std::cmp::Ordering, EvalError> {
    let (a, b) = (as_f64(a)?, as_f64(b)?);
    a.partial_cmp(&b)
        .ok_or_else(|| EvalError::Type("NaN is not comparable".into()))
}

fn compare(
    args: &[Value],
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<Value, EvalError> {
    binary(args, |a, b| Ok(Value::Bool(accept(numeric_cmp(a, b)?))))
}

fn fold_ord(args: &[Value], keep: std::cmp::Ordering) -> Result<Value, EvalError> {
    if args.is_empty() {
        return Err(EvalError::Arity("min/max need arguments".into()));
    }
    let mut best = args[0].clone();
    for next in &args[1..] {
        if numeric_cmp(next, &best)? == keep {
            best = next.clone();
        }
    }
    Ok(best)
}

fn lookup(collection: &Value, key: &Value) -> Result<Option<Value>, EvalError> {
    match (collection, key) {
        (Value::Map(m), Value::Keyword(k)) => Ok(m.get(k).cloned()),
        (Value::Map(m), Value::Str(k)) => Ok(m.get(k).cloned()),
        (Value::Vector(items), Value::Int(i)) => {
            Ok(usize::try_from(*i).ok().and_then(|i| items.get(i).cloned()))
        }
        (Value::Nil, _) => Ok(None),
        _ => Err(EvalError::Type(format!(
            "cannot look up {} in {}",
            key.type_name(),
            collection.type_name()
        ))),
    }
}

/// Evaluate a program with the given bindings; if the final form yields a
/// function, apply it to `call_args`. This single entry point serves both
/// the contract protocol (code evaluates to a `check` function) and the
/// invoke protocol.
pub fn eval_entry(
    src: &str,
    bindings: &[(&str, Value)],
    call_args: Option<Vec<Value>>,
    host: &mut dyn LangHost,
    budget: EvalBudget,
) -> Result<EvalOutcome, EvalError> {
    let program = parse_program(src).map_err(|e| EvalError::Parse(e.to_string()))?;
    let scope = Scope::root();
    for (name, value) in bindings {
        scope.define(*name, value.clone());
    }
    let mut evaluator = Evaluator::new(host, budget);
    let mut result = Value::Nil;
    for form in &program {
        result = evaluator.eval(form, &scope)?;
    }
    if let (Value::Fn(lambda), Some(args)) = (&result, call_args) {
        let lambda = Rc::clone(lambda);
        result = evaluator.apply(&lambda, args)?;
    }
    Ok(EvalOutcome {
        value: result,
        fuel_used: evaluator.fuel_used(),
    })
}
