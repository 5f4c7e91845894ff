//! Expression parsing and evaluation.
//!
//! Expressions are evaluated against a JSON data context. The language
//! supports:
//!
//! - `ctx.field` - context field access (`ctx.field.nested` for nesting)
//! - literals - `true`, `false`, `null`, numbers, `"strings"`, `[a, b, c]`
//! - `a == b` / `a != b` - equality (strings, numbers, booleans, null)
//! - `a > b`, `a >= b`, `a < b`, `a <= b` - numeric comparison
//! - `!expr` - logical NOT
//! - `expr && expr` - logical AND (higher precedence than OR)
//! - `expr || expr` - logical OR
//! - `(expr)` - grouping for precedence control
//!
//! Examples:
//! - `ctx.enabled` - true if enabled is truthy
//! - `ctx.amount > 100 && ctx.approved` - compound condition
//! - `ctx.status == "active"` - string comparison
//! - `[1, 2, ctx.third]` - array value
//!
//! Conditions are ordinary expressions interpreted through truthiness
//! (empty strings/arrays/objects, `0`, `null` and `false` are falsy).

use crate::error::ExprError;
use serde_json::Value;

/// A parsed expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Literal JSON value.
    Literal(Value),
    /// Context field access by dotted path.
    Field(String),
    /// Array of sub-expressions.
    Array(Vec<Expr>),
    /// Equality comparison.
    Eq(Box<Expr>, Box<Expr>),
    /// Inequality comparison.
    Ne(Box<Expr>, Box<Expr>),
    /// Greater than.
    Gt(Box<Expr>, Box<Expr>),
    /// Greater or equal.
    Ge(Box<Expr>, Box<Expr>),
    /// Less than.
    Lt(Box<Expr>, Box<Expr>),
    /// Less or equal.
    Le(Box<Expr>, Box<Expr>),
    /// Logical AND.
    And(Box<Expr>, Box<Expr>),
    /// Logical OR.
    Or(Box<Expr>, Box<Expr>),
    /// Logical NOT.
    Not(Box<Expr>),
}

impl Expr {
    /// Parses an expression from a string.
    pub fn parse(s: &str) -> Result<Self, ExprError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ExprError::parse("empty expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos != parser.input.len() {
            return Err(ExprError::parse(format!(
                "unexpected trailing input at position {}",
                parser.pos
            )));
        }
        Ok(expr)
    }

    /// Evaluates the expression against a context, producing a value.
    pub fn eval(&self, ctx: &Value) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Field(path) => Ok(get_path(ctx, path)),
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.eval(ctx)?);
                }
                Ok(Value::Array(out))
            }
            Expr::Eq(a, b) => Ok(Value::Bool(values_equal(&a.eval(ctx)?, &b.eval(ctx)?))),
            Expr::Ne(a, b) => Ok(Value::Bool(!values_equal(&a.eval(ctx)?, &b.eval(ctx)?))),
            Expr::Gt(a, b) => numeric_cmp(a, b, ctx, |x, y| x > y),
            Expr::Ge(a, b) => numeric_cmp(a, b, ctx, |x, y| x >= y),
            Expr::Lt(a, b) => numeric_cmp(a, b, ctx, |x, y| x < y),
            Expr::Le(a, b) => numeric_cmp(a, b, ctx, |x, y| x <= y),
            Expr::And(a, b) => {
                if !is_truthy(&a.eval(ctx)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&b.eval(ctx)?)))
            }
            Expr::Or(a, b) => {
                if is_truthy(&a.eval(ctx)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&b.eval(ctx)?)))
            }
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.eval(ctx)?))),
        }
    }

    /// Evaluates the expression as a boolean condition (via truthiness).
    pub fn eval_bool(&self, ctx: &Value) -> Result<bool, ExprError> {
        Ok(is_truthy(&self.eval(ctx)?))
    }

    /// Evaluates the expression, requiring a JSON array result.
    pub fn eval_array(&self, ctx: &Value) -> Result<Vec<Value>, ExprError> {
        match self.eval(ctx)? {
            Value::Array(items) => Ok(items),
            other => Err(ExprError::NotAnArray {
                found: type_name(&other).to_string(),
            }),
        }
    }
}

fn numeric_cmp(
    a: &Expr,
    b: &Expr,
    ctx: &Value,
    op: impl Fn(f64, f64) -> bool,
) -> Result<Value, ExprError> {
    let a = as_f64(&a.eval(ctx)?);
    let b = as_f64(&b.eval(ctx)?);
    // Non-numeric operands compare false, matching truthy-style leniency.
    Ok(Value::Bool(
        a.zip(b).map(|(a, b)| op(a, b)).unwrap_or(false),
    ))
}

/// Reads a dotted path out of a JSON object. Missing fields yield `Null`.
pub fn get_path(ctx: &Value, path: &str) -> Value {
    let mut current = ctx;
    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part).unwrap_or(&Value::Null);
            }
            _ => return Value::Null,
        }
    }
    current.clone()
}

/// Writes a value at a dotted path, creating intermediate objects as needed.
/// Intermediate non-object values are replaced.
pub fn set_path(ctx: &mut Value, path: &str, value: Value) {
    let mut current = ctx;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().unwrap();
        if i == parts.len() - 1 {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert(Value::Object(serde_json::Map::new()));
    }
}

/// Removes a top-level key, returning the previous value if any.
pub fn remove_key(ctx: &mut Value, key: &str) -> Option<Value> {
    ctx.as_object_mut().and_then(|map| map.remove(key))
}

/// JSON truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_equal(a, b))
        }
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Simple recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            self.skip_whitespace();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            self.skip_whitespace();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        self.skip_whitespace();

        // `!=` is a comparison, a bare `!` is negation
        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            self.skip_whitespace();
            let inner = self.parse_unary()?; // recursive to allow !!ctx.a
            return Ok(Expr::Not(Box::new(inner)));
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_operand()?;
        self.skip_whitespace();

        let ops: [(&str, fn(Box<Expr>, Box<Expr>) -> Expr); 6] = [
            ("==", Expr::Eq),
            ("!=", Expr::Ne),
            (">=", Expr::Ge),
            ("<=", Expr::Le),
            (">", Expr::Gt),
            ("<", Expr::Lt),
        ];

        for (token, build) in ops {
            if self.peek_str(token) {
                self.pos += token.len();
                self.skip_whitespace();
                let right = self.parse_operand()?;
                return Ok(build(Box::new(left), Box::new(right)));
            }
        }

        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Expr, ExprError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err(ExprError::parse("expected ')'"));
                }
                self.pos += 1;
                Ok(expr)
            }
            Some('[') => self.parse_array(),
            Some('"') => Ok(Expr::Literal(self.parse_string_value()?)),
            Some(c) if c.is_ascii_digit() || c == '-' => {
                Ok(Expr::Literal(self.parse_number_value()?))
            }
            _ => self.parse_keyword_or_field(),
        }
    }

    fn parse_keyword_or_field(&mut self) -> Result<Expr, ExprError> {
        let rest = &self.input[self.pos..];

        for (kw, value) in [
            ("true", Value::Bool(true)),
            ("false", Value::Bool(false)),
            ("null", Value::Null),
        ] {
            if rest.starts_with(kw) && !continues_ident(rest, kw.len()) {
                self.pos += kw.len();
                return Ok(Expr::Literal(value));
            }
        }

        self.parse_field().map(Expr::Field)
    }

    fn parse_array(&mut self) -> Result<Expr, ExprError> {
        self.pos += 1; // consume '['
        let mut items = Vec::new();

        self.skip_whitespace();
        if self.peek_char() == Some(']') {
            self.pos += 1;
            return Ok(Expr::Array(items));
        }

        loop {
            items.push(self.parse_expr()?);
            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => {
                    self.pos += 1;
                }
                Some(']') => {
                    self.pos += 1;
                    return Ok(Expr::Array(items));
                }
                _ => return Err(ExprError::parse("expected ',' or ']' in array")),
            }
        }
    }

    fn parse_field(&mut self) -> Result<String, ExprError> {
        let start = self.pos;

        // Expect "ctx." prefix
        if !self.peek_str("ctx.") {
            return Err(ExprError::parse("field must start with 'ctx.'"));
        }
        self.pos += 4;

        // Parse field name (including nested dots)
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }

        let field = &self.input[start + 4..self.pos];
        if field.is_empty() {
            return Err(ExprError::parse("empty field name"));
        }

        Ok(field.to_string())
    }

    fn parse_string_value(&mut self) -> Result<Value, ExprError> {
        self.pos += 1; // consume opening quote

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            if c == '"' {
                self.pos += 1;
                return Ok(Value::String(out));
            }
            if c == '\\' {
                self.pos += 1;
                match self.peek_char() {
                    Some(escaped) => {
                        out.push(escaped);
                        self.pos += escaped.len_utf8();
                    }
                    None => break,
                }
            } else {
                out.push(c);
                self.pos += c.len_utf8();
            }
        }

        Err(ExprError::parse("unterminated string"))
    }

    fn parse_number_value(&mut self) -> Result<Value, ExprError> {
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.peek_char() == Some('.') {
            self.pos += 1;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let num_str = &self.input[start..self.pos];
        let num: f64 = num_str
            .parse()
            .map_err(|_| ExprError::parse(format!("invalid number: '{}'", num_str)))?;

        serde_json::Number::from_f64(num)
            .map(Value::Number)
            .ok_or_else(|| ExprError::parse(format!("non-finite number: '{}'", num_str)))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

fn continues_ident(s: &str, at: usize) -> bool {
    s[at..]
        .chars()
        .next()
        .map(|c| c.is_alphanumeric() || c == '_')
        .unwrap_or(false)
}
