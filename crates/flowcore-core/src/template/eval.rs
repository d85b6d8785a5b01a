//! Renders a parsed `Template` against an `Environment`-shaped `Value`
//! root, dispatching bare calls through the fixed function map shared by
//! SQL, URL, body, header-value, response-body, cache-key, and
//! rate-limit-key templates (§6 "Template function surface").

use std::collections::BTreeMap;

use thiserror::Error;

use super::ast::{Template, TemplateExpr, TemplateLiteral, TemplateNode};
use flowcore_workflow::value::Value;

#[derive(Debug, Clone, Error)]
pub enum TemplateRenderError {
    #[error("unknown template function '{0}'")]
    UnknownFunction(String),
    #[error("{0}: {1}")]
    Function(String, String),
    #[error("require: '{0}' is missing or empty")]
    Required(String),
    #[error("division by zero")]
    DivisionByZero,
}

/// Renders a template to its final string form.
pub fn render(template: &Template, root: &Value) -> Result<String, TemplateRenderError> {
    let mut out = String::new();
    for node in template {
        match node {
            TemplateNode::Text(t) => out.push_str(t),
            TemplateNode::Expr(e) => out.push_str(&eval(e, root)?.render()),
        }
    }
    Ok(out)
}

fn eval(expr: &TemplateExpr, root: &Value) -> Result<Value, TemplateRenderError> {
    match expr {
        TemplateExpr::Literal(TemplateLiteral::Int(i)) => Ok(Value::Int(*i)),
        TemplateExpr::Literal(TemplateLiteral::Float(f)) => Ok(Value::Float(*f)),
        TemplateExpr::Literal(TemplateLiteral::String(s)) => Ok(Value::String(s.clone())),
        TemplateExpr::Path(segs) => Ok(resolve_path(root, segs)),
        TemplateExpr::Call { name, args } => {
            let values = args
                .iter()
                .map(|a| eval(a, root))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &values)
        }
    }
}

fn resolve_path(root: &Value, segs: &[String]) -> Value {
    let mut cur = root.clone();
    for seg in segs {
        if cur.is_null() {
            return Value::Null;
        }
        cur = cur.get_property(seg);
    }
    cur
}

fn call(name: &str, args: &[Value]) -> Result<Value, TemplateRenderError> {
    match name {
        // A bare path segment with no function applied arrives here too,
        // when the parser treats an unparenthesized ident as a zero-arg
        // call (`template::parser::parse_atom`'s trailing comment) — but
        // in practice every registered name below takes at least the
        // implicit "nothing" zero-arg form only for no-op passthroughs,
        // so we special-case none of that here; every name must resolve.
        "json" => {
            let v = one(name, args)?;
            Ok(Value::String(
                serde_json::to_string(&v.to_json())
                    .map_err(|e| fn_err(name, e.to_string()))?,
            ))
        }
        "jsonIndent" => {
            let v = one(name, args)?;
            Ok(Value::String(
                serde_json::to_string_pretty(&v.to_json())
                    .map_err(|e| fn_err(name, e.to_string()))?,
            ))
        }
        "upper" => Ok(Value::String(str_arg(name, one(name, args)?)?.to_uppercase())),
        "lower" => Ok(Value::String(str_arg(name, one(name, args)?)?.to_lowercase())),
        "trim" => Ok(Value::String(str_arg(name, one(name, args)?)?.trim().to_string())),
        "replace" => {
            let (a, b, c) = three(name, args)?;
            let s = a.render();
            Ok(Value::String(s.replace(&b.render(), &c.render())))
        }
        "contains" => {
            let (a, b) = two(name, args)?;
            Ok(Value::Bool(a.render().contains(&b.render())))
        }
        "hasPrefix" => {
            let (a, b) = two(name, args)?;
            Ok(Value::Bool(a.render().starts_with(&b.render())))
        }
        "hasSuffix" => {
            let (a, b) = two(name, args)?;
            Ok(Value::Bool(a.render().ends_with(&b.render())))
        }
        "default" => {
            let (a, b) = two(name, args)?;
            Ok(if is_missing(&a) { b } else { a })
        }
        "coalesce" => {
            for a in args {
                if !is_missing(a) {
                    return Ok(a.clone());
                }
            }
            Ok(Value::Null)
        }
        "getOr" => {
            // `getOr path fallback` — by the time it's here, the path
            // has already been resolved to a `Value` by `eval`, so this
            // is just `default` under the name the spec uses at the
            // call site (`(getOr .steps.fetch.data "x")`).
            let (a, b) = two(name, args)?;
            Ok(if is_missing(&a) { b } else { a })
        }
        "require" => {
            let v = one(name, args)?;
            if is_missing(&v) {
                return Err(TemplateRenderError::Required(v.render()));
            }
            Ok(v)
        }
        "has" => {
            let (a, b) = two(name, args)?;
            let key = b.render();
            Ok(Value::Bool(match &a {
                Value::Map(m) => m.contains_key(&key),
                Value::List(items) => key
                    .parse::<usize>()
                    .map(|i| i < items.len())
                    .unwrap_or(false),
                _ => false,
            }))
        }
        "add" => numeric2(name, args, |a, b| a + b, |a, b| a + b),
        "sub" => numeric2(name, args, |a, b| a - b, |a, b| a - b),
        "mul" => numeric2(name, args, |a, b| a * b, |a, b| a * b),
        "div" => {
            let (a, b) = two(name, args)?;
            let bf = num_arg(name, &b)?;
            if bf == 0.0 {
                return Err(TemplateRenderError::DivisionByZero);
            }
            numeric2(name, args, |a, b| a / b, |a, b| a / b)
        }
        "mod" => {
            let (a, b) = two(name, args)?;
            let _ = a;
            let bf = num_arg(name, &b)?;
            if bf == 0.0 {
                return Err(TemplateRenderError::DivisionByZero);
            }
            numeric2(name, args, |a, b| a % b, |a, b| a % b)
        }
        other => Err(TemplateRenderError::UnknownFunction(other.to_string())),
    }
}

fn is_missing(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn fn_err(name: &str, msg: String) -> TemplateRenderError {
    TemplateRenderError::Function(name.to_string(), msg)
}

fn one<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value, TemplateRenderError> {
    args.first()
        .ok_or_else(|| fn_err(name, "expects 1 argument".to_string()))
}

fn two(name: &str, args: &[Value]) -> Result<(Value, Value), TemplateRenderError> {
    if args.len() < 2 {
        return Err(fn_err(name, format!("expects 2 arguments, got {}", args.len())));
    }
    Ok((args[0].clone(), args[1].clone()))
}

fn three(name: &str, args: &[Value]) -> Result<(Value, Value, Value), TemplateRenderError> {
    if args.len() < 3 {
        return Err(fn_err(name, format!("expects 3 arguments, got {}", args.len())));
    }
    Ok((args[0].clone(), args[1].clone(), args[2].clone()))
}

fn str_arg(name: &str, v: &Value) -> Result<String, TemplateRenderError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        other => Err(fn_err(name, format!("expected a string, got {}", other.type_name()))),
    }
}

fn num_arg(name: &str, v: &Value) -> Result<f64, TemplateRenderError> {
    v.as_f64()
        .ok_or_else(|| fn_err(name, format!("expected a number, got {}", v.type_name())))
}

fn numeric2(
    name: &str,
    args: &[Value],
    ff: impl Fn(f64, f64) -> f64,
    fi: impl Fn(i64, i64) -> i64,
) -> Result<Value, TemplateRenderError> {
    let (a, b) = two(name, args)?;
    if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
        return Ok(Value::Int(fi(*x, *y)));
    }
    let x = num_arg(name, &a)?;
    let y = num_arg(name, &b)?;
    Ok(Value::Float(ff(x, y)))
}

/// Builds the `Map` root an `Environment`-shaped template evaluates
/// against, from the same named sections the expression environment
/// exposes (`steps`, `trigger`, `workflow`, `vars`, `Param`). Kept
/// separate from `crate::expr::eval::Environment` since templates index
/// into a plain `Value` tree rather than through the expression
/// evaluator's function table.
pub fn root_from_sections(sections: BTreeMap<String, Value>) -> Value {
    Value::Map(sections.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parser::parse_template;

    fn root() -> Value {
        let mut steps = BTreeMap::new();
        let mut fetch = BTreeMap::new();
        fetch.insert("count".to_string(), Value::Int(2));
        fetch.insert(
            "data".to_string(),
            Value::List(vec![Value::Map(BTreeMap::new())]),
        );
        steps.insert("fetch".to_string(), Value::Map(fetch));
        let mut map = BTreeMap::new();
        map.insert("steps".to_string(), Value::Map(steps));
        Value::Map(map)
    }

    #[test]
    fn renders_json_of_path() {
        let t = parse_template("{\"data\": {{json .steps.fetch.data}}}").unwrap();
        let out = render(&t, &root()).unwrap();
        assert_eq!(out, "{\"data\": [{}]}");
    }

    #[test]
    fn renders_plain_path() {
        let t = parse_template("count={{.steps.fetch.count}}").unwrap();
        assert_eq!(render(&t, &root()).unwrap(), "count=2");
    }

    #[test]
    fn div_by_zero_errors() {
        let t = parse_template("{{div 1 0}}").unwrap();
        assert!(matches!(
            render(&t, &root()),
            Err(TemplateRenderError::DivisionByZero)
        ));
    }

    #[test]
    fn require_errors_on_missing() {
        let t = parse_template("{{require .steps.missing.field}}").unwrap();
        assert!(matches!(
            render(&t, &root()),
            Err(TemplateRenderError::Required(_))
        ));
    }

    #[test]
    fn default_falls_back_on_missing() {
        let t = parse_template(r#"{{default .steps.missing.field "fallback"}}"#).unwrap();
        assert_eq!(render(&t, &root()).unwrap(), "fallback");
    }
}
