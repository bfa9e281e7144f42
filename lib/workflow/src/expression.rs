//! Boolean predicates for CASE_WHEN tasks.
//!
//! Expressions are compiled once, when a definition is saved, and evaluated
//! against the finishing task's output map. The grammar is intentionally small:
//!
//! - Field access by dotted path (`amount`, `customer.tier`). A leading
//!   `output.` segment refers to the output map itself.
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Logic: `&&`/`and`, `||`/`or`, `!`/`not`, parentheses
//! - Literals: single or double quoted strings, numbers, `true`, `false`,
//!   `null`
//!
//! Numbers compare as f64. A comparison involving a missing field or
//! mismatched types is false rather than an error.

use serde_json::{Map, Value};
use std::fmt;

/// Root alias for the output map.
const OUTPUT_ROOT: &str = "output";

/// Deepest allowed nesting of `!` and parentheses.
const MAX_NESTING: usize = 64;

/// Longest accepted expression, in tokens.
const MAX_TOKENS: usize = 1024;

/// Errors from compiling an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    /// The expression is empty.
    Empty,
    /// The expression could not be parsed.
    Parse { message: String },
    /// The expression exceeds the nesting or length limit.
    TooComplex { limit: usize },
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty expression"),
            Self::Parse { message } => write!(f, "parse error: {message}"),
            Self::TooComplex { limit } => {
                write!(f, "expression too complex (limit {limit})")
            }
        }
    }
}

impl std::error::Error for ExpressionError {}

/// A compiled predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    /// Compiles `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is empty or malformed.
    pub fn compile(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }
        if tokens.len() > MAX_TOKENS {
            return Err(ExpressionError::TooComplex { limit: MAX_TOKENS });
        }
        let (expr, rest) = parse_or(&tokens, 0)?;
        if let Some(token) = rest.first() {
            return Err(parse_error(format!("unexpected token {token:?}")));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Returns the source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the predicate against an output map.
    #[must_use]
    pub fn evaluate(&self, output: &Map<String, Value>) -> bool {
        self.expr.eval(output)
    }
}

fn parse_error(message: impl Into<String>) -> ExpressionError {
    ExpressionError::Parse {
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let next = chars.get(i + 1).copied();
        match chars[i] {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            quote @ ('"' | '\'') => {
                let start = i + 1;
                let Some(len) = chars[start..].iter().position(|c| *c == quote) else {
                    return Err(parse_error("unterminated string literal"));
                };
                tokens.push(Token::Str(chars[start..start + len].iter().collect()));
                i = start + len + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let num = literal
                    .parse()
                    .map_err(|_| parse_error(format!("invalid number {literal}")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(parse_error(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(Value),
    Path(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CompareOp, Operand),
    Truthy(Operand),
}

type Parsed<'a> = Result<(Expr, &'a [Token]), ExpressionError>;

// Precedence, loosest first: || then && then ! then comparison.
// `depth` counts enclosing `!` and parentheses.
fn parse_or(tokens: &[Token], depth: usize) -> Parsed<'_> {
    let (mut left, mut rest) = parse_and(tokens, depth)?;
    while rest.first() == Some(&Token::Or) {
        let (right, r) = parse_and(&rest[1..], depth)?;
        left = Expr::Or(Box::new(left), Box::new(right));
        rest = r;
    }
    Ok((left, rest))
}

fn parse_and(tokens: &[Token], depth: usize) -> Parsed<'_> {
    let (mut left, mut rest) = parse_not(tokens, depth)?;
    while rest.first() == Some(&Token::And) {
        let (right, r) = parse_not(&rest[1..], depth)?;
        left = Expr::And(Box::new(left), Box::new(right));
        rest = r;
    }
    Ok((left, rest))
}

fn parse_not(tokens: &[Token], depth: usize) -> Parsed<'_> {
    let nested = matches!(tokens.first(), Some(Token::Not | Token::LParen));
    if nested && depth >= MAX_NESTING {
        return Err(ExpressionError::TooComplex { limit: MAX_NESTING });
    }
    match tokens.first() {
        Some(Token::Not) => {
            let (inner, rest) = parse_not(&tokens[1..], depth + 1)?;
            Ok((Expr::Not(Box::new(inner)), rest))
        }
        Some(Token::LParen) => {
            let (inner, rest) = parse_or(&tokens[1..], depth + 1)?;
            match rest.first() {
                Some(Token::RParen) => Ok((inner, &rest[1..])),
                _ => Err(parse_error("missing closing parenthesis")),
            }
        }
        _ => parse_comparison(tokens),
    }
}

fn parse_comparison(tokens: &[Token]) -> Parsed<'_> {
    let (left, rest) = parse_operand(tokens)?;
    let op = match rest.first() {
        Some(Token::Eq) => CompareOp::Eq,
        Some(Token::Ne) => CompareOp::Ne,
        Some(Token::Gt) => CompareOp::Gt,
        Some(Token::Lt) => CompareOp::Lt,
        Some(Token::Ge) => CompareOp::Ge,
        Some(Token::Le) => CompareOp::Le,
        _ => return Ok((Expr::Truthy(left), rest)),
    };
    let (right, rest) = parse_operand(&rest[1..])?;
    Ok((Expr::Compare(left, op, right), rest))
}

fn parse_operand(tokens: &[Token]) -> Result<(Operand, &[Token]), ExpressionError> {
    let Some(token) = tokens.first() else {
        return Err(parse_error("unexpected end of expression"));
    };
    let operand = match token {
        Token::Str(s) => Operand::Literal(Value::String(s.clone())),
        Token::Num(n) => Operand::Literal(
            serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
        ),
        Token::Bool(b) => Operand::Literal(Value::Bool(*b)),
        Token::Null => Operand::Literal(Value::Null),
        Token::Ident(path) => Operand::Path(path.split('.').map(str::to_string).collect()),
        other => return Err(parse_error(format!("expected value, got {other:?}"))),
    };
    Ok((operand, &tokens[1..]))
}

impl Expr {
    fn eval(&self, output: &Map<String, Value>) -> bool {
        match self {
            Self::Or(l, r) => l.eval(output) || r.eval(output),
            Self::And(l, r) => l.eval(output) && r.eval(output),
            Self::Not(inner) => !inner.eval(output),
            Self::Compare(l, op, r) => compare(&l.resolve(output), *op, &r.resolve(output)),
            Self::Truthy(operand) => truthy(&operand.resolve(output)),
        }
    }
}

impl Operand {
    fn resolve(&self, output: &Map<String, Value>) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Path(segments) => resolve_path(output, segments),
        }
    }
}

fn resolve_path(output: &Map<String, Value>, segments: &[String]) -> Value {
    let segments = match segments.split_first() {
        Some((root, rest)) if root == OUTPUT_ROOT && !output.contains_key(OUTPUT_ROOT) => rest,
        _ => segments,
    };
    let Some((first, rest)) = segments.split_first() else {
        return Value::Object(output.clone());
    };
    let mut current = match output.get(first) {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in rest {
        match current.get(segment) {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    if left.is_null() || right.is_null() {
        let both = left.is_null() && right.is_null();
        return match op {
            CompareOp::Eq => both,
            CompareOp::Ne => !both,
            _ => false,
        };
    }

    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        let equal = (l - r).abs() < f64::EPSILON;
        return match op {
            CompareOp::Eq => equal,
            CompareOp::Ne => !equal,
            CompareOp::Gt => l > r,
            CompareOp::Lt => l < r,
            CompareOp::Ge => l > r || equal,
            CompareOp::Le => l < r || equal,
        };
    }

    if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
        return match op {
            CompareOp::Eq => l == r,
            CompareOp::Ne => l != r,
            CompareOp::Gt => l > r,
            CompareOp::Lt => l < r,
            CompareOp::Ge => l >= r,
            CompareOp::Le => l <= r,
        };
    }

    if let (Some(l), Some(r)) = (left.as_bool(), right.as_bool()) {
        return match op {
            CompareOp::Eq => l == r,
            CompareOp::Ne => l != r,
            _ => false,
        };
    }

    // Mismatched types.
    matches!(op, CompareOp::Ne)
}
