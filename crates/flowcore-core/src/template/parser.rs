//! Splits a template string into text/expression segments (mirroring the
//! teacher's `parse_template` scan for `{{ ... }}`) and parses each
//! expression segment's bare-call grammar.

use thiserror::Error;

use super::ast::{Template, TemplateExpr, TemplateLiteral, TemplateNode};

#[derive(Debug, Clone, Error)]
pub enum TemplateParseError {
    #[error("unclosed '{{{{' in template")]
    UnclosedBrace,
    #[error("empty expression between '{{{{' and '}}}}'")]
    EmptyExpression,
    #[error("unexpected character '{0}' in template expression")]
    UnexpectedChar(char),
    #[error("expected a function name or path after '('")]
    ExpectedExpr,
    #[error("unterminated string literal in template expression")]
    UnterminatedString,
    #[error("unclosed '(' in template expression")]
    UnclosedParen,
}

/// Parses a full template string (arbitrary text interspersed with
/// `{{ expr }}` segments) into a sequence of text/expression nodes.
pub fn parse_template(input: &str) -> Result<Template, TemplateParseError> {
    let mut nodes = Vec::new();
    let mut pos = 0usize;

    while pos < input.len() {
        match input[pos..].find("{{") {
            Some(start) => {
                if start > 0 {
                    nodes.push(TemplateNode::Text(input[pos..pos + start].to_string()));
                }
                let expr_start = pos + start + 2;
                let end = input[expr_start..]
                    .find("}}")
                    .ok_or(TemplateParseError::UnclosedBrace)?;
                let expr_src = input[expr_start..expr_start + end].trim();
                if expr_src.is_empty() {
                    return Err(TemplateParseError::EmptyExpression);
                }
                let expr = parse_expr(expr_src)?;
                nodes.push(TemplateNode::Expr(expr));
                pos = expr_start + end + 2;
            }
            None => {
                nodes.push(TemplateNode::Text(input[pos..].to_string()));
                break;
            }
        }
    }

    Ok(nodes)
}

/// Parses the content of a single `{{ ... }}` segment: either a bare
/// path, or a space-separated function call whose arguments are paths,
/// literals, or parenthesized nested calls.
fn parse_expr(src: &str) -> Result<TemplateExpr, TemplateParseError> {
    let tokens = tokenize(src)?;
    let mut pos = 0usize;
    let expr = parse_call_or_atom(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(TemplateParseError::UnexpectedChar('?'));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Path(Vec<String>),
    Ident(String),
    Int(i64),
    Float(f64),
    String(String),
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Tok>, TemplateParseError> {
    let mut toks = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        s.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                if !closed {
                    return Err(TemplateParseError::UnterminatedString);
                }
                toks.push(Tok::String(s));
            }
            '.' => {
                let mut segs = vec![String::new()];
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    if chars[i] == '.' {
                        segs.push(String::new());
                    } else {
                        segs.last_mut().unwrap().push(chars[i]);
                    }
                    i += 1;
                }
                toks.push(Tok::Path(segs));
            }
            c if c.is_ascii_digit() || (c == '-' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit()) => {
                let start = i;
                i += 1;
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || (chars[i] == '.' && !is_float)) {
                    if chars[i] == '.' {
                        is_float = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    toks.push(Tok::Float(text.parse().unwrap_or(0.0)));
                } else {
                    toks.push(Tok::Int(text.parse().unwrap_or(0)));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                toks.push(Tok::Ident(text));
            }
            other => return Err(TemplateParseError::UnexpectedChar(other)),
        }
    }
    Ok(toks)
}

fn parse_call_or_atom(toks: &[Tok], pos: &mut usize) -> Result<TemplateExpr, TemplateParseError> {
    if *pos >= toks.len() {
        return Err(TemplateParseError::ExpectedExpr);
    }
    match &toks[*pos] {
        Tok::Ident(name) => {
            let name = name.clone();
            *pos += 1;
            let mut args = Vec::new();
            while *pos < toks.len() && !matches!(toks[*pos], Tok::RParen) {
                args.push(parse_atom(toks, pos)?);
            }
            // A bare identifier with no arguments is still a zero-arity
            // call; an unregistered name fails at render time.
            Ok(TemplateExpr::Call { name, args })
        }
        _ => parse_atom(toks, pos),
    }
}

fn parse_atom(toks: &[Tok], pos: &mut usize) -> Result<TemplateExpr, TemplateParseError> {
    if *pos >= toks.len() {
        return Err(TemplateParseError::ExpectedExpr);
    }
    let tok = toks[*pos].clone();
    match tok {
        Tok::Path(segs) => {
            *pos += 1;
            Ok(TemplateExpr::Path(segs))
        }
        Tok::String(s) => {
            *pos += 1;
            Ok(TemplateExpr::Literal(TemplateLiteral::String(s)))
        }
        Tok::Int(n) => {
            *pos += 1;
            Ok(TemplateExpr::Literal(TemplateLiteral::Int(n)))
        }
        Tok::Float(f) => {
            *pos += 1;
            Ok(TemplateExpr::Literal(TemplateLiteral::Float(f)))
        }
        Tok::LParen => {
            *pos += 1;
            let inner = parse_call_or_atom(toks, pos)?;
            if *pos >= toks.len() || !matches!(toks[*pos], Tok::RParen) {
                return Err(TemplateParseError::UnclosedParen);
            }
            *pos += 1;
            Ok(inner)
        }
        Tok::Ident(name) => {
            // A nested bare call without surrounding parens, e.g. the
            // outermost call's own name — only reachable through
            // `parse_call_or_atom`'s recursion into argument position
            // when the caller explicitly wrapped it in parens above;
            // treat an unparenthesized nested ident as a zero-arg call.
            *pos += 1;
            Ok(TemplateExpr::Call { name, args: Vec::new() })
        }
        Tok::RParen => Err(TemplateParseError::ExpectedExpr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_text_and_expr() {
        let t = parse_template("id={{ .trigger.params.id }}").unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t[0], TemplateNode::Text("id=".to_string()));
    }

    #[test]
    fn parses_bare_path() {
        let t = parse_template("{{.steps.fetch.count}}").unwrap();
        match &t[0] {
            TemplateNode::Expr(TemplateExpr::Path(segs)) => {
                assert_eq!(segs, &vec!["steps".to_string(), "fetch".to_string(), "count".to_string()]);
            }
            other => panic!("unexpected node: {other:?}"),
        }
    }

    #[test]
    fn parses_bare_function_call() {
        let t = parse_template("{{json .steps.fetch.data}}").unwrap();
        match &t[0] {
            TemplateNode::Expr(TemplateExpr::Call { name, args }) => {
                assert_eq!(name, "json");
                assert_eq!(args.len(), 1);
            }
            other => panic!("unexpected node: {other:?}"),
        }
    }

    #[test]
    fn parses_nested_call_in_parens() {
        let t = parse_template(r#"{{default (getOr .steps.fetch.data "x") "fallback"}}"#).unwrap();
        match &t[0] {
            TemplateNode::Expr(TemplateExpr::Call { name, args }) => {
                assert_eq!(name, "default");
                assert_eq!(args.len(), 2);
                assert!(matches!(&args[0], TemplateExpr::Call { name, .. } if name == "getOr"));
            }
            other => panic!("unexpected node: {other:?}"),
        }
    }

    #[test]
    fn rejects_unclosed_brace() {
        assert!(matches!(
            parse_template("hello {{ .trigger"),
            Err(TemplateParseError::UnclosedBrace)
        ));
    }

    #[test]
    fn plain_text_has_no_expr_nodes() {
        let t = parse_template("no templates here").unwrap();
        assert_eq!(t, vec![TemplateNode::Text("no templates here".to_string())]);
    }
}
