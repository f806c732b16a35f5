use serde_json::Value;

use super::lexer::{tokenize, Spanned, Token};
use super::EvalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Expression tree. Paths are the only way to reach data.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// One `name = expr` statement of a script.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub target: String,
    pub value: Expr,
}

/// Parse a single expression, stripping an optional `${ ... }` wrapper.
pub fn parse_expression(src: &str) -> Result<Expr, EvalError> {
    let src = strip_wrapper(src);
    let mut parser = Parser::new(tokenize(src)?);
    parser.skip_separators();
    let expr = parser.expression()?;
    parser.skip_separators();
    parser.expect_eof()?;
    Ok(expr)
}

/// Parse a script of `name = expr` statements separated by `;` or newlines.
pub fn parse_script(src: &str) -> Result<Vec<Assignment>, EvalError> {
    let mut parser = Parser::new(tokenize(src)?);
    let mut statements = Vec::new();

    loop {
        parser.skip_separators();
        if parser.peek() == &Token::Eof {
            break;
        }
        let target = match parser.advance() {
            (Token::Ident(name), _) => name,
            (other, pos) => {
                return Err(EvalError::Parse {
                    pos,
                    message: format!("expected assignment target, found {}", other),
                })
            }
        };
        parser.expect(Token::Assign)?;
        let value = parser.expression()?;
        statements.push(Assignment { target, value });
        match parser.peek() {
            Token::Semi | Token::Eof => {}
            other => {
                return Err(EvalError::Parse {
                    pos: parser.pos(),
                    message: format!("expected end of statement, found {}", other),
                })
            }
        }
    }

    Ok(statements)
}

fn strip_wrapper(src: &str) -> &str {
    let trimmed = src.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(trimmed)
}

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self { tokens, cursor: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.cursor.min(self.tokens.len() - 1)].0
    }

    fn pos(&self) -> usize {
        self.tokens[self.cursor.min(self.tokens.len() - 1)].1
    }

    fn advance(&mut self) -> Spanned {
        let tok = self.tokens[self.cursor.min(self.tokens.len() - 1)].clone();
        if self.cursor < self.tokens.len() - 1 {
            self.cursor += 1;
        }
        tok
    }

    fn expect(&mut self, want: Token) -> Result<(), EvalError> {
        let (got, pos) = self.advance();
        if got == want {
            Ok(())
        } else {
            Err(EvalError::Parse {
                pos,
                message: format!("expected {}, found {}", want, got),
            })
        }
    }

    fn expect_eof(&mut self) -> Result<(), EvalError> {
        match self.peek() {
            Token::Eof => Ok(()),
            other => Err(EvalError::Parse {
                pos: self.pos(),
                message: format!("unexpected {}", other),
            }),
        }
    }

    fn skip_separators(&mut self) {
        while self.peek() == &Token::Semi {
            self.advance();
        }
    }

    fn expression(&mut self) -> Result<Expr, EvalError> {
        self.binary(0)
    }

    /// Precedence climbing over the binary operator table.
    fn binary(&mut self, min_prec: u8) -> Result<Expr, EvalError> {
        let mut lhs = self.unary()?;
        while let Some((op, prec)) = binary_op(self.peek()) {
            if prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.binary(prec + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        match self.peek() {
            Token::Bang => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)))
            }
            Token::Minus => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        let (tok, pos) = self.advance();
        match tok {
            Token::Number(n) => Ok(Expr::Literal(number_value(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    let mut segments = vec![name];
                    while self.peek() == &Token::Dot {
                        self.advance();
                        match self.advance() {
                            (Token::Ident(seg), _) => segments.push(seg),
                            (Token::Number(n), _) if n.fract() == 0.0 && n >= 0.0 => {
                                segments.push((n as u64).to_string())
                            }
                            (other, pos) => {
                                return Err(EvalError::Parse {
                                    pos,
                                    message: format!("expected field name, found {}", other),
                                })
                            }
                        }
                    }
                    if self.peek() == &Token::LParen {
                        return Err(EvalError::Parse {
                            pos: self.pos(),
                            message: format!("function calls are not allowed ({})", segments.join(".")),
                        });
                    }
                    Ok(Expr::Path(segments))
                }
            },
            other => Err(EvalError::Parse {
                pos,
                message: format!("unexpected {}", other),
            }),
        }
    }
}

fn binary_op(tok: &Token) -> Option<(BinaryOp, u8)> {
    Some(match tok {
        Token::OrOr => (BinaryOp::Or, 1),
        Token::AndAnd => (BinaryOp::And, 2),
        Token::EqEq => (BinaryOp::Eq, 3),
        Token::NotEq => (BinaryOp::NotEq, 3),
        Token::Lt => (BinaryOp::Lt, 4),
        Token::Le => (BinaryOp::Le, 4),
        Token::Gt => (BinaryOp::Gt, 4),
        Token::Ge => (BinaryOp::Ge, 4),
        Token::Plus => (BinaryOp::Add, 5),
        Token::Minus => (BinaryOp::Sub, 5),
        Token::Star => (BinaryOp::Mul, 6),
        Token::Slash => (BinaryOp::Div, 6),
        Token::Percent => (BinaryOp::Rem, 6),
        _ => return None,
    })
}

/// Integral literals stay integers so `amount == 50` matches stored ints.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
