//! AST for the `{{ }}`-wrapped template language used to render SQL,
//! URLs, request/response bodies, cache keys, and rate-limit keys.
//!
//! This is a deliberately distinct grammar from `crate::expr`: paths are
//! written with a leading dot (`.trigger.params.id`) and function calls
//! are space-separated with no parens or commas (`json .steps.fetch.data`),
//! matching the teacher's own `{{ $json.field }}` template syntax
//! (`n8n-core/src/expression/parser.rs::parse_template`) generalized to
//! this system's leading-dot path style and bare-call function surface.

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateNode {
    Text(String),
    Expr(TemplateExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateExpr {
    /// A leading-dot path, e.g. `.trigger.params.id` -> `["trigger", "params", "id"]`.
    Path(Vec<String>),
    Literal(TemplateLiteral),
    /// A bare, space-separated function call: `json .steps.fetch.data`.
    Call {
        name: String,
        args: Vec<TemplateExpr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateLiteral {
    Int(i64),
    Float(f64),
    String(String),
}

pub type Template = Vec<TemplateNode>;
