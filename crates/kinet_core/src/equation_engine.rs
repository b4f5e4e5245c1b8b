//! Expression AST and the infix parser that produces it.
//!
//! The AST is the hand-off format between whatever loads a model and the
//! compiler in [`crate::compiled`]. Identifiers stay unresolved here; symbol
//! resolution and arity checks happen at compile time.

use crate::error::{SimError, SimResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Name of the built-in simulation time symbol.
pub const TIME_SYMBOL: &str = "time";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Number(f64),
    Symbol(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    pub fn number(value: f64) -> Self {
        Expr::Number(value)
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        Expr::Symbol(name.into())
    }

    pub fn binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Self {
        Expr::Binary(Box::new(lhs), op, Box::new(rhs))
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call(name.into(), args)
    }

    /// Symbols whose *current* value this expression reads. The first
    /// argument of `delay(x, lag)` reads a past value and is excluded, so it
    /// never creates an ordering constraint between assignments.
    pub fn instantaneous_symbols(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Symbol(name) => {
                if name != TIME_SYMBOL {
                    out.insert(name.clone());
                }
            }
            Expr::Unary(_, operand) => operand.instantaneous_symbols(out),
            Expr::Binary(lhs, _, rhs) => {
                lhs.instantaneous_symbols(out);
                rhs.instantaneous_symbols(out);
            }
            Expr::Call(name, args) => {
                let skip = usize::from(name == "delay");
                for arg in args.iter().skip(skip) {
                    arg.instantaneous_symbols(out);
                }
            }
        }
    }
}

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> SimResult<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
    Bang,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
}

fn tokenize(input: &str) -> SimResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !num_str.contains(|ch: char| ch == 'e' || ch == 'E') {
                    num_str.push(d);
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            num_str.push(sign);
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
            let value = num_str.parse().map_err(|_| SimError::Parse {
                position: tokens.len(),
                message: format!("invalid number literal '{num_str}'"),
            })?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            chars.next();
            let next = chars.peek().copied();
            let token = match (c, next) {
                ('<', Some('=')) => Token::LessEq,
                ('>', Some('=')) => Token::GreaterEq,
                ('=', Some('=')) => Token::EqEq,
                ('!', Some('=')) => Token::NotEq,
                ('&', Some('&')) => Token::AndAnd,
                ('|', Some('|')) => Token::OrOr,
                ('<', _) => Token::Less,
                ('>', _) => Token::Greater,
                ('!', _) => Token::Bang,
                ('+', _) => Token::Plus,
                ('-', _) => Token::Minus,
                ('*', _) => Token::Star,
                ('/', _) => Token::Slash,
                ('^', _) => Token::Caret,
                ('(', _) => Token::LParen,
                (')', _) => Token::RParen,
                (',', _) => Token::Comma,
                _ => {
                    return Err(SimError::Parse {
                        position: tokens.len(),
                        message: format!("unexpected character '{c}'"),
                    })
                }
            };
            if matches!(
                token,
                Token::LessEq
                    | Token::GreaterEq
                    | Token::EqEq
                    | Token::NotEq
                    | Token::AndAnd
                    | Token::OrOr
            ) {
                chars.next();
            }
            tokens.push(token);
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: &str) -> SimError {
        SimError::Parse {
            position: self.pos,
            message: message.to_string(),
        }
    }

    fn expect(&mut self, token: Token, message: &str) -> SimResult<()> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    fn parse_expression(&mut self) -> SimResult<Expr> {
        self.parse_or()
    }

    /// Left-associative binary level: `next (op next)*`.
    fn parse_level(
        &mut self,
        next: fn(&mut Self) -> SimResult<Expr>,
        ops: &[(Token, BinaryOp)],
    ) -> SimResult<Expr> {
        let mut left = next(self)?;
        'outer: loop {
            for (token, op) in ops {
                if self.peek() == Some(token) {
                    self.pos += 1;
                    let right = next(self)?;
                    left = Expr::binary(left, *op, right);
                    continue 'outer;
                }
            }
            break;
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> SimResult<Expr> {
        self.parse_level(Self::parse_and, &[(Token::OrOr, BinaryOp::Or)])
    }

    fn parse_and(&mut self) -> SimResult<Expr> {
        self.parse_level(Self::parse_equality, &[(Token::AndAnd, BinaryOp::And)])
    }

    fn parse_equality(&mut self) -> SimResult<Expr> {
        self.parse_level(
            Self::parse_comparison,
            &[(Token::EqEq, BinaryOp::Eq), (Token::NotEq, BinaryOp::Ne)],
        )
    }

    fn parse_comparison(&mut self) -> SimResult<Expr> {
        self.parse_level(
            Self::parse_term,
            &[
                (Token::LessEq, BinaryOp::Le),
                (Token::GreaterEq, BinaryOp::Ge),
                (Token::Less, BinaryOp::Lt),
                (Token::Greater, BinaryOp::Gt),
            ],
        )
    }

    fn parse_term(&mut self) -> SimResult<Expr> {
        self.parse_level(
            Self::parse_factor,
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
        )
    }

    fn parse_factor(&mut self) -> SimResult<Expr> {
        self.parse_level(
            Self::parse_unary,
            &[(Token::Star, BinaryOp::Mul), (Token::Slash, BinaryOp::Div)],
        )
    }

    fn parse_unary(&mut self) -> SimResult<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)))
            }
            Some(Token::Bang) => {
                self.consume();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)))
            }
            _ => self.parse_power(),
        }
    }

    // Right associative; the exponent may carry its own sign (2^-1).
    fn parse_power(&mut self) -> SimResult<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::binary(base, BinaryOp::Pow, exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> SimResult<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_expression()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.consume();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen, "expected ')' after arguments")?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Symbol(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect(Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            Some(_) => {
                self.pos -= 1;
                Err(self.error("unexpected token"))
            }
            None => Err(self.error("unexpected end of input")),
        }
    }
}
