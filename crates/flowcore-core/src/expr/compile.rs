//! Compiles expression source into a `Program`: a fully alias-expanded,
//! division-checked AST plus enough bookkeeping to reconstruct error
//! locations and negated forms.

use thiserror::Error;

use super::ast::{BinaryOp, Expr, Literal};
use super::parser::{self, ParseError};

#[derive(Debug, Clone, Error)]
pub enum ExpressionError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("division by a non-literal denominator; use divOr(n, d, fallback) for dynamic divisors")]
    NonLiteralDivisor,
    #[error("division by literal zero")]
    DivisionByZero,
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("'{0}' expects {1} argument(s), got {2}")]
    ArityMismatch(String, usize, usize),
    #[error("type error: {0}")]
    TypeError(String),
    #[error("undefined identifier '{0}'")]
    UndefinedIdentifier(String),
}

/// A compiled expression, carrying its original source so that callers
/// needing a negated form (e.g. building `!alias` without re-parsing)
/// can reconstruct it from the same text.
#[derive(Debug, Clone)]
pub struct Program {
    pub source: String,
    pub expr: Expr,
    /// Whether this program is evaluated in a boolean (condition)
    /// context, as opposed to a value-producing one (`iterate.over`,
    /// `computed_params`).
    pub as_bool: bool,
}

/// Compiles `source` into a `Program`, substituting `aliases` and
/// rejecting any `/` or `%` whose divisor isn't a nonzero numeric
/// literal (dynamic denominators must go through `divOr`).
pub fn compile(
    source: &str,
    aliases: &std::collections::BTreeMap<String, Expr>,
    as_bool: bool,
) -> Result<Program, ExpressionError> {
    let raw = parser::parse(source)?;
    let expanded = raw.expand_aliases(aliases);
    check_division_safety(&expanded)?;
    Ok(Program {
        source: source.to_string(),
        expr: expanded,
        as_bool,
    })
}

fn check_division_safety(expr: &Expr) -> Result<(), ExpressionError> {
    match expr {
        Expr::Binary { left, op, right } => {
            if matches!(op, BinaryOp::Div | BinaryOp::Mod) {
                match right.as_ref() {
                    Expr::Literal(Literal::Int(0)) => return Err(ExpressionError::DivisionByZero),
                    Expr::Literal(Literal::Float(f)) if *f == 0.0 => {
                        return Err(ExpressionError::DivisionByZero)
                    }
                    Expr::Literal(Literal::Int(_)) | Expr::Literal(Literal::Float(_)) => {}
                    _ => return Err(ExpressionError::NonLiteralDivisor),
                }
            }
            check_division_safety(left)?;
            check_division_safety(right)
        }
        Expr::Unary { operand, .. } => check_division_safety(operand),
        Expr::PropertyAccess { object, .. } => check_division_safety(object),
        Expr::IndexAccess { object, index } => {
            check_division_safety(object)?;
            check_division_safety(index)
        }
        Expr::Call { args, .. } => {
            for a in args {
                check_division_safety(a)?;
            }
            Ok(())
        }
        Expr::List(items) => {
            for i in items {
                check_division_safety(i)?;
            }
            Ok(())
        }
        Expr::Literal(_) | Expr::Identifier(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn compiles_simple_condition() {
        let aliases = BTreeMap::new();
        let program = compile("steps.fetch.count > 0", &aliases, true).unwrap();
        assert!(program.as_bool);
    }

    #[test]
    fn rejects_dynamic_divisor() {
        let aliases = BTreeMap::new();
        let err = compile("total / steps.count", &aliases, false).unwrap_err();
        assert!(matches!(err, ExpressionError::NonLiteralDivisor));
    }

    #[test]
    fn accepts_literal_divisor() {
        let aliases = BTreeMap::new();
        let program = compile("total / 2", &aliases, false).unwrap();
        assert!(!program.as_bool);
    }

    #[test]
    fn expands_alias_before_division_check() {
        // If an alias itself divides by a non-literal, that must still
        // be caught once substituted into the caller.
        let mut aliases = BTreeMap::new();
        aliases.insert(
            "ratio".to_string(),
            super::super::parser::parse("a / b").unwrap(),
        );
        let err = compile("ratio > 1", &aliases, true).unwrap_err();
        assert!(matches!(err, ExpressionError::NonLiteralDivisor));
    }
}
