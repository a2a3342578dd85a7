//! Boolean Expression Language
//!
//! A small expression language used for rule predicates and workflow edge
//! conditions. Supports:
//! - comparisons: `==`, `!=`, `>`, `>=`, `<`, `<=`, `contains`
//! - boolean combinators: `&&`, `||`, `!`, parentheses
//! - literals: double- or single-quoted strings, numbers, `true`, `false`, `null`
//! - context references: dotted paths (`eventType`, `metadata.region`) or
//!   template form (`{{x}}`), resolved against a JSON object
//!
//! Example: `eventType == "order.created" && metadata.amount > 100`

use serde_json::Value;

use crate::{NotifyError, Result};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse an expression from source text.
    pub fn parse(src: &str) -> Result<Expr> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0, src };
        let expr = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(NotifyError::Expression(format!(
                "trailing input at token {} in '{}'",
                parser.pos, src
            )));
        }
        Ok(expr)
    }

    /// Evaluate against a JSON object context, returning a boolean verdict.
    ///
    /// A bare path or literal is truthy when it is neither null, false, 0,
    /// nor the empty string.
    pub fn evaluate(&self, ctx: &Value) -> Result<bool> {
        Ok(truthy(&self.value_of(ctx)?))
    }

    fn value_of(&self, ctx: &Value) -> Result<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(path) => Ok(lookup_path(ctx, path).cloned().unwrap_or(Value::Null)),
            Expr::Not(inner) => Ok(Value::Bool(!inner.evaluate(ctx)?)),
            Expr::And(a, b) => Ok(Value::Bool(a.evaluate(ctx)? && b.evaluate(ctx)?)),
            Expr::Or(a, b) => Ok(Value::Bool(a.evaluate(ctx)? || b.evaluate(ctx)?)),
            Expr::Cmp(op, a, b) => {
                let left = a.value_of(ctx)?;
                let right = b.value_of(ctx)?;
                Ok(Value::Bool(compare(*op, &left, &right)))
            }
        }
    }
}

/// Convenience: parse and evaluate in one step.
pub fn eval_str(src: &str, ctx: &Value) -> Result<bool> {
    Expr::parse(src)?.evaluate(ctx)
}

/// Look up a dotted path in a JSON value.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    match op {
        CmpOp::Eq => loose_eq(left, right),
        CmpOp::Ne => !loose_eq(left, right),
        CmpOp::Contains => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| loose_eq(item, needle)),
            _ => false,
        },
        CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le => {
            let ordering = match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => match (left, right) {
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => None,
                },
            };
            match (op, ordering) {
                (CmpOp::Gt, Some(o)) => o == std::cmp::Ordering::Greater,
                (CmpOp::Ge, Some(o)) => o != std::cmp::Ordering::Less,
                (CmpOp::Lt, Some(o)) => o == std::cmp::Ordering::Less,
                (CmpOp::Le, Some(o)) => o != std::cmp::Ordering::Greater,
                _ => false,
            }
        }
    }
}

/// Equality with numeric coercion: `"1" == 1` holds, matching how template
/// values round-trip through substitution.
fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ============================================================================
// Tokenizer / Parser
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Literal(Value),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(CmpOp::Gt));
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(CmpOp::Lt));
                i += 1;
            }
            '{' if chars.get(i + 1) == Some(&'{') => {
                // {{path}}: template-style reference
                let start = i + 2;
                let mut end = start;
                while end + 1 < chars.len() && !(chars[end] == '}' && chars[end + 1] == '}') {
                    end += 1;
                }
                if end + 1 >= chars.len() {
                    return Err(NotifyError::Expression(format!("unterminated {{{{ in '{}'", src)));
                }
                let path: String = chars[start..end].iter().collect();
                tokens.push(Token::Path(path.trim().to_string()));
                i = end + 2;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(NotifyError::Expression(format!("unterminated string in '{}'", src)));
                }
                let s: String = chars[start..end].iter().collect();
                tokens.push(Token::Literal(Value::String(s)));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| NotifyError::Expression(format!("bad number '{}'", text)))?;
                let num = serde_json::Number::from_f64(n)
                    .ok_or_else(|| NotifyError::Expression(format!("bad number '{}'", text)))?;
                tokens.push(Token::Literal(Value::Number(num)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Literal(Value::Bool(true))),
                    "false" => tokens.push(Token::Literal(Value::Bool(false))),
                    "null" => tokens.push(Token::Literal(Value::Null)),
                    "contains" => tokens.push(Token::Op(CmpOp::Contains)),
                    _ => tokens.push(Token::Path(word)),
                }
            }
            other => {
                return Err(NotifyError::Expression(format!(
                    "unexpected character '{}' in '{}'",
                    other, src
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.next();
            let right = self.operand()?;
            return Ok(Expr::Cmp(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn operand(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::Path(p)) => Ok(Expr::Path(p)),
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(NotifyError::Expression(format!("missing ')' in '{}'", self.src))),
                }
            }
            other => Err(NotifyError::Expression(format!(
                "unexpected token {:?} in '{}'",
                other, self.src
            ))),
        }
    }
}
