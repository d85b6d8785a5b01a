//! Evaluates a compiled `Program` against an `Environment`.
//!
//! This only ever walks the AST the compiler produced — no text is
//! re-parsed at evaluation time, matching the "opcode tree" invariant.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell_replacement::OnceRegex;
use regex::Regex;

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};
use super::compile::{ExpressionError, Program};
use flowcore_workflow::value::Value;

/// Validates a public ID against a namespace; bridges to the
/// collaborator-provided public-ID codec (§6) without this module
/// depending on the codec trait directly.
pub type PublicIdValidator = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// The read-only binding environment an expression evaluates against:
/// the root object (typically a `steps`/`trigger`/`workflow`/`vars` map)
/// plus the injected public-ID validator used by `isValidPublicID`.
#[derive(Clone)]
pub struct Environment {
    root: Value,
    public_id_validator: Option<PublicIdValidator>,
}

impl Environment {
    pub fn new(root: Value) -> Self {
        Environment {
            root,
            public_id_validator: None,
        }
    }

    pub fn with_public_id_validator(mut self, validator: PublicIdValidator) -> Self {
        self.public_id_validator = Some(validator);
        self
    }

    /// The environment's root object, for callers that need to render a
    /// template against the same bindings an expression just evaluated
    /// against (templates and expressions share one root shape but are
    /// distinct grammars — see `crate::template`).
    pub fn root(&self) -> &Value {
        &self.root
    }

    fn lookup(&self, name: &str) -> Value {
        self.root.get_property(name)
    }
}

pub fn eval(program: &Program, env: &Environment) -> Result<Value, ExpressionError> {
    eval_expr(&program.expr, env)
}

fn eval_expr(expr: &Expr, env: &Environment) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(lit) => Ok(literal_to_value(lit)),
        Expr::Identifier(name) => Ok(env.lookup(name)),
        Expr::PropertyAccess { object, property } => {
            let obj = eval_expr(object, env)?;
            Ok(obj.get_property(property))
        }
        Expr::IndexAccess { object, index } => {
            let obj = eval_expr(object, env)?;
            let idx = eval_expr(index, env)?;
            let i = idx
                .as_int()
                .ok_or_else(|| ExpressionError::TypeError("index must be numeric".into()))?;
            Ok(obj.get_index(i))
        }
        Expr::List(items) => {
            let values = items
                .iter()
                .map(|i| eval_expr(i, env))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::List(values))
        }
        Expr::Unary { op, operand } => {
            let v = eval_expr(operand, env)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
                UnaryOp::Neg => match v {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(ExpressionError::TypeError(format!(
                        "cannot negate a {}",
                        other.type_name()
                    ))),
                },
            }
        }
        Expr::Binary { left, op, right } => eval_binary(left, *op, right, env),
        Expr::Call { name, args } => eval_call(name, args, env),
    }
}

fn literal_to_value(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::String(s) => Value::String(s.clone()),
    }
}

fn eval_binary(
    left: &Expr,
    op: BinaryOp,
    right: &Expr,
    env: &Environment,
) -> Result<Value, ExpressionError> {
    // Short-circuit logical operators.
    if matches!(op, BinaryOp::And) {
        let l = eval_expr(left, env)?;
        if !l.is_truthy() {
            return Ok(Value::Bool(false));
        }
        let r = eval_expr(right, env)?;
        return Ok(Value::Bool(r.is_truthy()));
    }
    if matches!(op, BinaryOp::Or) {
        let l = eval_expr(left, env)?;
        if l.is_truthy() {
            return Ok(Value::Bool(true));
        }
        let r = eval_expr(right, env)?;
        return Ok(Value::Bool(r.is_truthy()));
    }

    let l = eval_expr(left, env)?;
    let r = eval_expr(right, env)?;

    match op {
        BinaryOp::Add => numeric_or_concat(&l, &r, |a, b| a + b, |a, b| a + b),
        BinaryOp::Sub => numeric_binop(&l, &r, |a, b| a - b, |a, b| a - b),
        BinaryOp::Mul => numeric_binop(&l, &r, |a, b| a * b, |a, b| a * b),
        BinaryOp::Div => {
            // The compiler already guarantees `right` came from a
            // nonzero numeric literal for the `Div` case, but division
            // can also appear through alias expansion reaching this
            // evaluator directly in tests, so guard defensively.
            let divisor = r
                .as_f64()
                .ok_or_else(|| ExpressionError::TypeError("non-numeric divisor".into()))?;
            if divisor == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            numeric_binop(&l, &r, |a, b| a / b, |a, b| a / b)
        }
        BinaryOp::Mod => {
            let divisor = r
                .as_f64()
                .ok_or_else(|| ExpressionError::TypeError("non-numeric divisor".into()))?;
            if divisor == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            numeric_binop(&l, &r, |a, b| a % b, |a, b| a % b)
        }
        BinaryOp::Eq => Ok(Value::Bool(l == r)),
        BinaryOp::Ne => Ok(Value::Bool(l != r)),
        BinaryOp::Lt => compare(&l, &r, std::cmp::Ordering::is_lt),
        BinaryOp::Le => compare(&l, &r, std::cmp::Ordering::is_le),
        BinaryOp::Gt => compare(&l, &r, std::cmp::Ordering::is_gt),
        BinaryOp::Ge => compare(&l, &r, std::cmp::Ordering::is_ge),
        BinaryOp::Contains => eval_contains(&l, &r),
        BinaryOp::Matches => eval_matches(&l, &r),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above with short-circuiting"),
    }
}

fn numeric_binop(
    l: &Value,
    r: &Value,
    ff: impl Fn(f64, f64) -> f64,
    fi: impl Fn(i64, i64) -> i64,
) -> Result<Value, ExpressionError> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(fi(*a, *b))),
        _ => {
            let a = l
                .as_f64()
                .ok_or_else(|| ExpressionError::TypeError(format!("expected number, got {}", l.type_name())))?;
            let b = r
                .as_f64()
                .ok_or_else(|| ExpressionError::TypeError(format!("expected number, got {}", r.type_name())))?;
            Ok(Value::Float(ff(a, b)))
        }
    }
}

fn numeric_or_concat(
    l: &Value,
    r: &Value,
    ff: impl Fn(f64, f64) -> f64,
    fi: impl Fn(i64, i64) -> i64,
) -> Result<Value, ExpressionError> {
    if let (Value::String(a), Value::String(b)) = (l, r) {
        return Ok(Value::String(format!("{a}{b}")));
    }
    numeric_binop(l, r, ff, fi)
}

fn compare(l: &Value, r: &Value, pred: impl Fn(std::cmp::Ordering) -> bool) -> Result<Value, ExpressionError> {
    match l.partial_cmp(r) {
        Some(ord) => Ok(Value::Bool(pred(ord))),
        None => Err(ExpressionError::TypeError(format!(
            "cannot compare {} and {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn eval_contains(l: &Value, r: &Value) -> Result<Value, ExpressionError> {
    match l {
        Value::List(items) => Ok(Value::Bool(items.contains(r))),
        Value::String(s) => {
            let needle = r
                .as_str()
                .ok_or_else(|| ExpressionError::TypeError("`in` on a string needs a string needle".into()))?;
            Ok(Value::Bool(s.contains(needle)))
        }
        Value::Map(m) => {
            let key = r
                .as_str()
                .ok_or_else(|| ExpressionError::TypeError("`in` on a map needs a string key".into()))?;
            Ok(Value::Bool(m.contains_key(key)))
        }
        other => Err(ExpressionError::TypeError(format!(
            "`in` is not supported on {}",
            other.type_name()
        ))),
    }
}

fn eval_matches(l: &Value, r: &Value) -> Result<Value, ExpressionError> {
    let subject = l
        .as_str()
        .ok_or_else(|| ExpressionError::TypeError("`~=` left side must be a string".into()))?;
    let pattern = r
        .as_str()
        .ok_or_else(|| ExpressionError::TypeError("`~=` right side must be a string".into()))?;
    let re = Regex::new(pattern)
        .map_err(|e| ExpressionError::TypeError(format!("invalid regex '{pattern}': {e}")))?;
    Ok(Value::Bool(re.is_match(subject)))
}

fn eval_call(name: &str, args: &[Expr], env: &Environment) -> Result<Value, ExpressionError> {
    let values = args
        .iter()
        .map(|a| eval_expr(a, env))
        .collect::<Result<Vec<_>, _>>()?;
    call_builtin(name, &values, env)
}

fn arity(name: &str, values: &[Value], n: usize) -> Result<(), ExpressionError> {
    if values.len() != n {
        return Err(ExpressionError::ArityMismatch(name.to_string(), n, values.len()));
    }
    Ok(())
}

fn call_builtin(name: &str, values: &[Value], env: &Environment) -> Result<Value, ExpressionError> {
    match name {
        "divOr" => {
            arity(name, values, 3)?;
            let n = values[0]
                .as_f64()
                .ok_or_else(|| ExpressionError::TypeError("divOr: numerator must be numeric".into()))?;
            let d = values[1]
                .as_f64()
                .ok_or_else(|| ExpressionError::TypeError("divOr: denominator must be numeric".into()))?;
            if d == 0.0 {
                return Ok(values[2].clone());
            }
            if let (Value::Int(a), Value::Int(b)) = (&values[0], &values[1]) {
                return Ok(Value::Int(a / b));
            }
            Ok(Value::Float(n / d))
        }
        "len" => {
            arity(name, values, 1)?;
            match &values[0] {
                Value::List(l) => Ok(Value::Int(l.len() as i64)),
                Value::Map(m) => Ok(Value::Int(m.len() as i64)),
                Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::Null => Ok(Value::Int(0)),
                other => Err(ExpressionError::TypeError(format!("len: unsupported type {}", other.type_name()))),
            }
        }
        "isEmpty" => {
            arity(name, values, 1)?;
            Ok(Value::Bool(match &values[0] {
                Value::List(l) => l.is_empty(),
                Value::Map(m) => m.is_empty(),
                Value::String(s) => s.is_empty(),
                Value::Null => true,
                _ => false,
            }))
        }
        "contains" => {
            arity(name, values, 2)?;
            eval_contains(&values[0], &values[1])
        }
        "hasPrefix" => {
            arity(name, values, 2)?;
            let s = str_arg(name, &values[0])?;
            let p = str_arg(name, &values[1])?;
            Ok(Value::Bool(s.starts_with(p)))
        }
        "hasSuffix" => {
            arity(name, values, 2)?;
            let s = str_arg(name, &values[0])?;
            let p = str_arg(name, &values[1])?;
            Ok(Value::Bool(s.ends_with(p)))
        }
        "matches" => {
            arity(name, values, 2)?;
            eval_matches(&values[0], &values[1])
        }
        "isEmail" => {
            arity(name, values, 1)?;
            let s = str_arg(name, &values[0])?;
            Ok(Value::Bool(OnceRegex::email().is_match(s)))
        }
        "isUUID" => {
            arity(name, values, 1)?;
            let s = str_arg(name, &values[0])?;
            Ok(Value::Bool(OnceRegex::uuid().is_match(s)))
        }
        "isValidPublicID" => {
            arity(name, values, 2)?;
            match (values[0].as_str(), values[1].as_str()) {
                (Some(namespace), Some(value)) => match &env.public_id_validator {
                    Some(validator) => Ok(Value::Bool(validator(namespace, value))),
                    None => Ok(Value::Bool(false)),
                },
                _ => Ok(Value::Bool(false)),
            }
        }
        "first" => {
            arity(name, values, 1)?;
            match &values[0] {
                Value::List(l) => Ok(l.first().cloned().unwrap_or(Value::Null)),
                Value::String(s) => Ok(s.chars().next().map(|c| Value::String(c.to_string())).unwrap_or(Value::Null)),
                other => Err(ExpressionError::TypeError(format!("first: unsupported type {}", other.type_name()))),
            }
        }
        "upper" => {
            arity(name, values, 1)?;
            Ok(Value::String(str_arg(name, &values[0])?.to_uppercase()))
        }
        "lower" => {
            arity(name, values, 1)?;
            Ok(Value::String(str_arg(name, &values[0])?.to_lowercase()))
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

fn str_arg<'a>(fn_name: &str, v: &'a Value) -> Result<&'a str, ExpressionError> {
    v.as_str()
        .ok_or_else(|| ExpressionError::TypeError(format!("{fn_name}: expected a string argument")))
}

/// Lazily-compiled regexes used by the built-in validators. Named to
/// read like the `once_cell`/`std::sync::OnceLock` idiom without adding
/// another dependency solely for two constant patterns.
mod once_cell_replacement {
    use regex::Regex;
    use std::sync::OnceLock;

    pub struct OnceRegex;

    impl OnceRegex {
        pub fn email() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap())
        }

        pub fn uuid() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| {
                Regex::new(
                    r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
                )
                .unwrap()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::compile::compile;
    use std::collections::BTreeMap as Map;

    fn root_env(pairs: &[(&str, Value)]) -> Environment {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        Environment::new(Value::Map(map))
    }

    #[test]
    fn evaluates_comparison() {
        let aliases = Map::new();
        let program = compile("count > 3", &aliases, true).unwrap();
        let env = root_env(&[("count", Value::Int(5))]);
        assert_eq!(eval(&program, &env).unwrap(), Value::Bool(true));
    }

    #[test]
    fn evaluates_div_or_fallback() {
        let aliases = Map::new();
        let program = compile("divOr(total, count, -1)", &aliases, false).unwrap();
        let env = root_env(&[("total", Value::Int(10)), ("count", Value::Int(0))]);
        assert_eq!(eval(&program, &env).unwrap(), Value::Int(-1));
    }

    #[test]
    fn evaluates_matches_operator() {
        let aliases = Map::new();
        let program = compile(r#"id ~= "^[0-9]+$""#, &aliases, true).unwrap();
        let env = root_env(&[("id", Value::String("12345".into()))]);
        assert_eq!(eval(&program, &env).unwrap(), Value::Bool(true));
    }

    #[test]
    fn evaluates_contains_on_list() {
        let aliases = Map::new();
        let program = compile(r#""admin" in roles"#, &aliases, true).unwrap();
        let env = root_env(&[(
            "roles",
            Value::List(vec![Value::String("admin".into()), Value::String("user".into())]),
        )]);
        assert_eq!(eval(&program, &env).unwrap(), Value::Bool(true));
    }

    #[test]
    fn short_circuits_and() {
        let aliases = Map::new();
        let program = compile("false && (1 / 1 == 1)", &aliases, true).unwrap();
        let env = Environment::new(Value::Map(BTreeMap::new()));
        assert_eq!(eval(&program, &env).unwrap(), Value::Bool(false));
    }

    #[test]
    fn validates_email_and_uuid() {
        let aliases = Map::new();
        let program = compile(r#"isEmail("a@b.com")"#, &aliases, true).unwrap();
        let env = Environment::new(Value::Map(BTreeMap::new()));
        assert_eq!(eval(&program, &env).unwrap(), Value::Bool(true));

        let program = compile(r#"isUUID("not-a-uuid")"#, &aliases, true).unwrap();
        assert_eq!(eval(&program, &env).unwrap(), Value::Bool(false));
    }

    #[test]
    fn is_valid_public_id_rejects_non_string_operands_without_error() {
        let aliases = Map::new();
        let program = compile(r#"isValidPublicID(123, "x")"#, &aliases, true).unwrap();
        let env = Environment::new(Value::Map(BTreeMap::new())).with_public_id_validator(std::sync::Arc::new(|_, _| true));
        assert_eq!(eval(&program, &env).unwrap(), Value::Bool(false));

        let program = compile(r#"isValidPublicID("ns", null)"#, &aliases, true).unwrap();
        assert_eq!(eval(&program, &env).unwrap(), Value::Bool(false));
    }

    #[test]
    fn is_valid_public_id_invokes_validator_when_both_operands_are_strings() {
        let aliases = Map::new();
        let program = compile(r#"isValidPublicID("ns", "abc")"#, &aliases, true).unwrap();
        let env = Environment::new(Value::Map(BTreeMap::new()))
            .with_public_id_validator(std::sync::Arc::new(|ns, v| ns == "ns" && v == "abc"));
        assert_eq!(eval(&program, &env).unwrap(), Value::Bool(true));
    }
}
