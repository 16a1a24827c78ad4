//! `Condition` expressions over named variables
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := compare ( "&&" compare )*
//! compare := unary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") unary )?
//! unary   := "!"* primary
//! primary := number | "string" | true | false | name | $name | "(" or ")"
//! ```
//!
//! Variables hold strings; `"true"`/`"false"` and numeric strings are read as
//! booleans and numbers. `hour`, `minute` and `weekday` (Sunday = 0) come from
//! the evaluation clock unless a variable of the same name exists.
//!
//! Input is capped at [`MAX_LENGTH`] bytes and [`MAX_DEPTH`] levels of `!`
//! and parentheses.
//!
//! ```
//! use pfw::core::expr;
//! use std::collections::BTreeMap;
//!
//! let mut vars = BTreeMap::new();
//! vars.insert("guest_mode".to_string(), "true".to_string());
//!
//! let report = expr::test("guest_mode && $limit != 0", &vars);
//! assert!(!report.valid);
//!
//! vars.insert("limit".to_string(), "5".to_string());
//! let report = expr::test("guest_mode && $limit != 0", &vars);
//! assert!(report.valid);
//! assert_eq!(report.result, Some(expr::Value::Bool(true)));
//! ```

use crate::core::error::ExprError;
use chrono::{Datelike, NaiveDateTime, Timelike};
use logos::Logos;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Longest accepted expression, in bytes
pub const MAX_LENGTH: usize = 1024;

/// Deepest accepted nesting of `!` and `(`
pub const MAX_DEPTH: usize = 32;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
enum Token {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("!")]
    Not,
    #[token("&&")]
    And,
    #[token("||")]
    Or,
    #[token("==")]
    Eq,
    #[token("!=")]
    Ne,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[regex(r"-?[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),
    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    #[regex(r"'([^'\\]|\\.)*'", |lex| unescape(lex.slice()))]
    Str(String),
    #[regex(r"\$?[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().trim_start_matches('$').to_string())]
    Ident(String),
}

fn unescape(quoted: &str) -> String {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Not => write!(f, "!"),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "\"{s}\""),
            Token::Ident(name) => write!(f, "{name}"),
        }
    }
}

/// Evaluated value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Value {
    /// Reads a stored variable string.
    pub fn from_variable(raw: &str) -> Self {
        match raw.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            s => s
                .parse::<f64>()
                .map_or_else(|_| Value::Str(raw.to_string()), Value::Number),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    const fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    const fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Names referenced by the expression, in order of first appearance.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_vars(&mut out);
        out
    }

    fn collect_vars<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Var(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Expr::Not(inner) => inner.collect_vars(out),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(_, a, b) => {
                a.collect_vars(out);
                b.collect_vars(out);
            }
        }
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let item = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        item
    }

    fn descend(&mut self, levels: usize) -> Result<(), ExprError> {
        self.depth += levels;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.compare()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.compare()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn compare(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.unary()?;
        Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)))
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let mut nots = 0;
        while self.peek() == Some(&Token::Not) {
            self.pos += 1;
            nots += 1;
        }
        self.descend(nots)?;
        let mut expr = self.primary()?;
        for _ in 0..nots {
            expr = Expr::Not(Box::new(expr));
        }
        self.depth -= nots;
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let (token, offset) = self.next().ok_or(ExprError::UnexpectedEnd)?;
        match token {
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Ident(name) => Ok(Expr::Var(name)),
            Token::LParen => {
                self.descend(1)?;
                let inner = self.or()?;
                self.depth -= 1;
                match self.next() {
                    Some((Token::RParen, _)) => Ok(inner),
                    Some((found, offset)) => Err(ExprError::UnexpectedToken {
                        found: found.to_string(),
                        offset,
                    }),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            other => Err(ExprError::UnexpectedToken {
                found: other.to_string(),
                offset,
            }),
        }
    }
}

/// Parses an expression without evaluating it.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    if input.len() > MAX_LENGTH {
        return Err(ExprError::TooLong(MAX_LENGTH));
    }
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(input);
    while let Some(token) = lexer.next() {
        let offset = lexer.span().start;
        let token = token.map_err(|()| ExprError::Lex(offset))?;
        tokens.push((token, offset));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    if let Some((found, offset)) = parser.next() {
        return Err(ExprError::UnexpectedToken {
            found: found.to_string(),
            offset,
        });
    }
    Ok(expr)
}

/// Variables plus the clock used for `hour`, `minute` and `weekday`
pub struct Context<'a> {
    pub variables: &'a BTreeMap<String, String>,
    pub now: NaiveDateTime,
}

impl<'a> Context<'a> {
    pub fn new(variables: &'a BTreeMap<String, String>, now: NaiveDateTime) -> Self {
        Self { variables, now }
    }

    fn lookup(&self, name: &str) -> Result<Value, ExprError> {
        if let Some(raw) = self.variables.get(name) {
            return Ok(Value::from_variable(raw));
        }
        let clock = match name {
            "hour" => self.now.hour(),
            "minute" => self.now.minute(),
            "weekday" => self.now.weekday().num_days_from_sunday(),
            _ => return Err(ExprError::UnknownVariable(name.to_string())),
        };
        Ok(Value::Number(f64::from(clock)))
    }
}

pub fn eval(expr: &Expr, ctx: &Context<'_>) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => ctx.lookup(name),
        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, ctx)?.truthy())),
        Expr::And(a, b) => {
            if !eval(a, ctx)?.truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(b, ctx)?.truthy()))
        }
        Expr::Or(a, b) => {
            if eval(a, ctx)?.truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(b, ctx)?.truthy()))
        }
        Expr::Compare(op, a, b) => {
            let lhs = eval(a, ctx)?;
            let rhs = eval(b, ctx)?;
            compare(*op, &lhs, &rhs).map(Value::Bool)
        }
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, ExprError> {
    use std::cmp::Ordering;

    let mismatch = || ExprError::TypeMismatch {
        op: op.symbol(),
        left: lhs.type_name(),
        right: rhs.type_name(),
    };

    let ordering: Option<Ordering> = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => {
            return match op {
                CmpOp::Eq => Ok(a == b),
                CmpOp::Ne => Ok(a != b),
                _ => Err(mismatch()),
            };
        }
        (Value::Number(a), Value::Str(s)) => {
            let b = s.trim().parse::<f64>().map_err(|_| mismatch())?;
            a.partial_cmp(&b)
        }
        (Value::Str(s), Value::Number(b)) => {
            let a = s.trim().parse::<f64>().map_err(|_| mismatch())?;
            a.partial_cmp(b)
        }
        _ => return Err(mismatch()),
    };

    let Some(ordering) = ordering else {
        return Ok(op == CmpOp::Ne);
    };
    Ok(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}

/// Parses and evaluates a rule `Condition`. Empty means unconditional.
pub fn condition_holds(condition: &str, ctx: &Context<'_>) -> Result<bool, ExprError> {
    if condition.trim().is_empty() {
        return Ok(true);
    }
    Ok(eval(&parse(condition)?, ctx)?.truthy())
}

/// Result of a dry-run evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExprReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Evaluates `input` against `variables` at the current local time.
pub fn test(input: &str, variables: &BTreeMap<String, String>) -> ExprReport {
    test_at(input, variables, chrono::Local::now().naive_local())
}

pub fn test_at(input: &str, variables: &BTreeMap<String, String>, now: NaiveDateTime) -> ExprReport {
    let outcome = parse(input).and_then(|expr| eval(&expr, &Context::new(variables, now)));
    match outcome {
        Ok(value) => ExprReport {
            valid: true,
            result: Some(value),
            error: None,
        },
        Err(e) => ExprReport {
            valid: false,
            result: None,
            error: Some(e.to_string()),
        },
    }
}
