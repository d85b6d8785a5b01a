//! Recursive-descent parser for the predicate/value expression language.
//!
//! Precedence (low to high): `||` → `&&` → equality → comparison →
//! `in`/`~=` → additive → multiplicative → unary → postfix (`.prop`,
//! `[index]`, `(args)`) → primary.

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};
use super::lexer::{LexError, Lexer, Token};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("lex error: {0}")]
    Lex(#[from] LexError),
    #[error("unexpected token {found:?}, expected {expected}")]
    Unexpected { found: Token, expected: &'static str },
    #[error("trailing input after expression")]
    TrailingInput,
    #[error("division by literal zero is not allowed; use divOr(n, d, fallback)")]
    DivisionByZeroLiteral,
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(src);
        let current = lexer.next_token()?;
        Ok(Parser { lexer, current })
    }

    fn advance(&mut self) -> Result<Token, ParseError> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn expect(&mut self, tok: &Token, expected: &'static str) -> Result<(), ParseError> {
        if &self.current == tok {
            self.advance()?;
            Ok(())
        } else {
            Err(ParseError::Unexpected {
                found: self.current.clone(),
                expected,
            })
        }
    }

    pub fn parse(src: &str) -> Result<Expr, ParseError> {
        let mut parser = Parser::new(src)?;
        let expr = parser.parse_or()?;
        if parser.current != Token::Eof {
            return Err(ParseError::TrailingInput);
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.current == Token::Or {
            self.advance()?;
            let right = self.parse_and()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_equality()?;
        while self.current == Token::And {
            self.advance()?;
            let right = self.parse_equality()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.current {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_membership()?;
        loop {
            let op = match self.current {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_membership()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_membership(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.current {
                Token::Contains => BinaryOp::Contains,
                Token::Matches => BinaryOp::Matches,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_additive()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_unary()?;
            if matches!(op, BinaryOp::Div | BinaryOp::Mod) {
                if let Expr::Literal(lit) = &right {
                    let is_zero = matches!(lit, Literal::Int(0))
                        || matches!(lit, Literal::Float(f) if *f == 0.0);
                    if is_zero {
                        return Err(ParseError::DivisionByZeroLiteral);
                    }
                }
            }
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.current {
            Token::Not => {
                self.advance()?;
                let operand = self.parse_unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                })
            }
            Token::Minus => {
                self.advance()?;
                let operand = self.parse_unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match &self.current {
                Token::Dot => {
                    self.advance()?;
                    let name = match self.advance()? {
                        Token::Ident(n) => n,
                        other => {
                            return Err(ParseError::Unexpected {
                                found: other,
                                expected: "property name",
                            })
                        }
                    };
                    expr = Expr::PropertyAccess {
                        object: Box::new(expr),
                        property: name,
                    };
                }
                Token::LBracket => {
                    self.advance()?;
                    let index = self.parse_or()?;
                    self.expect(&Token::RBracket, "]")?;
                    expr = Expr::IndexAccess {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_argument_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.current == Token::RParen {
            return Ok(args);
        }
        args.push(self.parse_or()?);
        while self.current == Token::Comma {
            self.advance()?;
            args.push(self.parse_or()?);
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance()? {
            Token::Null => Ok(Expr::Literal(Literal::Null)),
            Token::True => Ok(Expr::Literal(Literal::Bool(true))),
            Token::False => Ok(Expr::Literal(Literal::Bool(false))),
            Token::Int(i) => Ok(Expr::Literal(Literal::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(Literal::Float(f))),
            Token::String(s) => Ok(Expr::Literal(Literal::String(s))),
            Token::Ident(name) => {
                if self.current == Token::LParen {
                    self.advance()?;
                    let args = self.parse_argument_list()?;
                    self.expect(&Token::RParen, ")")?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Identifier(name))
                }
            }
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, ")")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if self.current != Token::RBracket {
                    items.push(self.parse_or()?);
                    while self.current == Token::Comma {
                        self.advance()?;
                        items.push(self.parse_or()?);
                    }
                }
                self.expect(&Token::RBracket, "]")?;
                Ok(Expr::List(items))
            }
            other => Err(ParseError::Unexpected {
                found: other,
                expected: "expression",
            }),
        }
    }
}

pub fn parse(src: &str) -> Result<Expr, ParseError> {
    Parser::parse(src)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identifier() {
        assert_eq!(parse("found").unwrap(), Expr::Identifier("found".into()));
    }

    #[test]
    fn parses_property_access_chain() {
        let e = parse("steps.fetch.count").unwrap();
        assert_eq!(
            e,
            Expr::PropertyAccess {
                object: Box::new(Expr::PropertyAccess {
                    object: Box::new(Expr::Identifier("steps".into())),
                    property: "fetch".into(),
                }),
                property: "count".into(),
            }
        );
    }

    #[test]
    fn parses_negated_alias() {
        let e = parse("!found").unwrap();
        assert_eq!(
            e,
            Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(Expr::Identifier("found".into())),
            }
        );
    }

    #[test]
    fn parses_compound_and() {
        let e = parse("found && valid_id").unwrap();
        assert_eq!(
            e,
            Expr::Binary {
                left: Box::new(Expr::Identifier("found".into())),
                op: BinaryOp::And,
                right: Box::new(Expr::Identifier("valid_id".into())),
            }
        );
    }

    #[test]
    fn parses_string_literal_without_expanding_as_identifier() {
        let e = parse(r#"status == "found""#).unwrap();
        match e {
            Expr::Binary { right, .. } => {
                assert_eq!(*right, Expr::Literal(Literal::String("found".into())));
            }
            _ => panic!("expected binary"),
        }
    }

    #[test]
    fn rejects_literal_zero_divisor() {
        assert!(matches!(
            parse("10 / 0"),
            Err(ParseError::DivisionByZeroLiteral)
        ));
        assert!(matches!(
            parse("10 % 0.0"),
            Err(ParseError::DivisionByZeroLiteral)
        ));
    }

    #[test]
    fn parses_function_call() {
        let e = parse("divOr(a, b, 0)").unwrap();
        match e {
            Expr::Call { name, args } => {
                assert_eq!(name, "divOr");
                assert_eq!(args.len(), 3);
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn parses_parenthesized_compound() {
        let e = parse("(a || b) && c").unwrap();
        assert_eq!(
            e,
            Expr::Binary {
                left: Box::new(Expr::Binary {
                    left: Box::new(Expr::Identifier("a".into())),
                    op: BinaryOp::Or,
                    right: Box::new(Expr::Identifier("b".into())),
                }),
                op: BinaryOp::And,
                right: Box::new(Expr::Identifier("c".into())),
            }
        );
    }
}
