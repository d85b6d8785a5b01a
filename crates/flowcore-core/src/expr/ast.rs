//! The expression language's abstract syntax tree.
//!
//! Parsing produces this tree; alias expansion walks and rewrites it;
//! compilation wraps the (possibly rewritten) tree into a `Program`
//! (`super::compile::Program`). The evaluator only ever walks a
//! `Program`'s tree — it never re-parses source text (§3 invariant:
//! "the program is evaluated purely as an opcode tree").

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Identifier(String),
    PropertyAccess {
        object: Box<Expr>,
        property: String,
    },
    IndexAccess {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    List(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Contains,
    Matches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl Expr {
    /// Walk every bare-identifier node and replace it with a deep copy of
    /// the matching alias's AST, *except* identifiers that occur as the
    /// right-hand side of a property-access operator, or (by
    /// construction — the lexer never emits an `Identifier` node from
    /// inside a string literal) inside string literals.
    ///
    /// This is the only alias-expansion code path; there is no parallel
    /// textual-substitution pass (§9 open question resolution).
    pub fn expand_aliases(&self, aliases: &std::collections::BTreeMap<String, Expr>) -> Expr {
        match self {
            Expr::Identifier(name) => aliases
                .get(name)
                .cloned()
                .unwrap_or_else(|| Expr::Identifier(name.clone())),
            Expr::PropertyAccess { object, property } => Expr::PropertyAccess {
                object: Box::new(object.expand_aliases(aliases)),
                // `property` is a selector name, never itself an
                // identifier expression — left untouched.
                property: property.clone(),
            },
            Expr::IndexAccess { object, index } => Expr::IndexAccess {
                object: Box::new(object.expand_aliases(aliases)),
                index: Box::new(index.expand_aliases(aliases)),
            },
            Expr::Call { name, args } => Expr::Call {
                name: name.clone(),
                args: args.iter().map(|a| a.expand_aliases(aliases)).collect(),
            },
            Expr::Binary { left, op, right } => Expr::Binary {
                left: Box::new(left.expand_aliases(aliases)),
                op: *op,
                right: Box::new(right.expand_aliases(aliases)),
            },
            Expr::Unary { op, operand } => Expr::Unary {
                op: *op,
                operand: Box::new(operand.expand_aliases(aliases)),
            },
            Expr::List(items) => {
                Expr::List(items.iter().map(|i| i.expand_aliases(aliases)).collect())
            }
            Expr::Literal(_) => self.clone(),
        }
    }

    /// Every bare identifier name referenced by this expression (used to
    /// build the alias dependency DAG). Property selectors and string
    /// contents are excluded, matching `expand_aliases`'s notion of what
    /// counts as a "bare identifier".
    pub fn referenced_identifiers(&self, out: &mut std::collections::BTreeSet<String>) {
        match self {
            Expr::Identifier(name) => {
                out.insert(name.clone());
            }
            Expr::PropertyAccess { object, .. } => object.referenced_identifiers(out),
            Expr::IndexAccess { object, index } => {
                object.referenced_identifiers(out);
                index.referenced_identifiers(out);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    a.referenced_identifiers(out);
                }
            }
            Expr::Binary { left, right, .. } => {
                left.referenced_identifiers(out);
                right.referenced_identifiers(out);
            }
            Expr::Unary { operand, .. } => operand.referenced_identifiers(out),
            Expr::List(items) => {
                for i in items {
                    i.referenced_identifiers(out);
                }
            }
            Expr::Literal(_) => {}
        }
    }
}
