//! Relational expression strings
//!
//! Kernels receive their expression as the text of a relational plan node,
//! for example:
//!
//! ```text
//! LogicalFilter(condition=[AND(>($0, 5), <>($1, 'x'))])
//! LogicalProject(id=[$0], total=[+($1, 1)])
//! BindableTableScan(table=[[main, t]], filters=[[>($0, 5)]], projects=[[0, 2]], aliases=[[id, v]])
//! ```
//!
//! This module extracts the parts kernels need and parses row expressions
//! into [`Expr`] trees.

use query_core::{QueryError, Result};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Null,
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Boolean(v) => write!(f, "{}", v),
            ScalarValue::Int64(v) => write!(f, "{}", v),
            ScalarValue::Float64(v) => write!(f, "{}", v),
            ScalarValue::Utf8(v) => write!(f, "'{}'", v),
            ScalarValue::Null => write!(f, "null"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
}

impl BinaryOp {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Subtract,
            "*" => BinaryOp::Multiply,
            "/" => BinaryOp::Divide,
            "MOD" => BinaryOp::Modulo,
            "=" => BinaryOp::Equal,
            "<>" => BinaryOp::NotEqual,
            "<" => BinaryOp::Less,
            "<=" => BinaryOp::LessEqual,
            ">" => BinaryOp::Greater,
            ">=" => BinaryOp::GreaterEqual,
            "AND" => BinaryOp::And,
            "OR" => BinaryOp::Or,
            _ => return None,
        })
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterEqual
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Minus,
    IsNull,
    IsNotNull,
}

/// Row expression over the columns of one batch
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `$n`
    Column(usize),
    Literal(ScalarValue),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
}

impl Expr {
    pub fn parse(text: &str) -> Result<Expr> {
        let mut parser = Parser::new(text);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if !parser.at_end() {
            return Err(parser.error("trailing input"));
        }
        Ok(expr)
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Literal(_))
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn error(&self, what: &str) -> QueryError {
        QueryError::ExpressionError(format!(
            "{} at offset {} in '{}'",
            what, self.pos, self.text
        ))
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        self.skip_whitespace();
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            _ => Err(self.error(&format!("expected '{}'", expected))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.skip_whitespace();
        match self.peek() {
            Some('$') => self.parse_column(),
            Some('\'') => self.parse_string(),
            Some(c) if c.is_ascii_digit() => self.parse_number(),
            Some('-') if self.rest()[1..].starts_with(|c: char| c.is_ascii_digit()) => {
                self.parse_number()
            }
            Some(_) => self.parse_call_or_keyword(),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_column(&mut self) -> Result<Expr> {
        self.bump();
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        let index = self.text[start..self.pos]
            .parse::<usize>()
            .map_err(|_| self.error("invalid column reference"))?;
        Ok(Expr::Column(index))
    }

    fn parse_string(&mut self) -> Result<Expr> {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('\'') if self.peek() == Some('\'') => {
                    self.bump();
                    value.push('\'');
                }
                Some('\'') => break,
                Some(c) => value.push(c),
                None => return Err(self.error("unterminated string literal")),
            }
        }
        self.skip_type_suffix();
        Ok(Expr::Literal(ScalarValue::Utf8(value)))
    }

    fn parse_number(&mut self) -> Result<Expr> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else if c == '.' || c == 'E' || c == 'e' {
                is_float = true;
                self.bump();
                if matches!(self.peek(), Some('-') | Some('+')) {
                    self.bump();
                }
            } else {
                break;
            }
        }
        let literal = &self.text[start..self.pos];
        let value = if is_float {
            literal
                .parse::<f64>()
                .map(ScalarValue::Float64)
                .map_err(|_| self.error("invalid float literal"))?
        } else {
            literal
                .parse::<i64>()
                .map(ScalarValue::Int64)
                .map_err(|_| self.error("invalid integer literal"))?
        };
        self.skip_type_suffix();
        Ok(Expr::Literal(value))
    }

    /// Skip a `:TYPE` annotation such as `5:BIGINT` or `1.5:DECIMAL(2, 1)`
    fn skip_type_suffix(&mut self) {
        if self.peek() != Some(':') {
            return;
        }
        self.bump();
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ')
        {
            // Stop before a space that does not continue the type name
            if self.peek() == Some(' ')
                && !self.rest()[1..].starts_with(|c: char| c.is_ascii_alphabetic())
            {
                break;
            }
            self.bump();
        }
        if self.peek() == Some('(') {
            let mut depth = 0;
            while let Some(c) = self.bump() {
                match c {
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn parse_call_or_keyword(&mut self) -> Result<Expr> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '(' || c == ')' || c == ',' {
                break;
            }
            self.bump();
        }
        let name = self.text[start..self.pos].trim().to_string();
        if name.is_empty() {
            return Err(self.error("expected expression"));
        }

        if self.peek() != Some('(') {
            return match name.to_ascii_lowercase().as_str() {
                "true" => Ok(Expr::Literal(ScalarValue::Boolean(true))),
                "false" => Ok(Expr::Literal(ScalarValue::Boolean(false))),
                "null" => Ok(Expr::Literal(ScalarValue::Null)),
                _ => Err(self.error(&format!("unknown identifier '{}'", name))),
            };
        }

        self.bump();
        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(')') {
            self.bump();
        } else {
            loop {
                args.push(self.parse_expr()?);
                self.skip_whitespace();
                match self.bump() {
                    Some(',') => continue,
                    Some(')') => break,
                    _ => return Err(self.error("expected ',' or ')'")),
                }
            }
        }
        build_call(&name, args).map_err(|e| match e {
            QueryError::ExpressionError(msg) => self.error(&msg),
            other => other,
        })
    }
}

fn build_call(name: &str, mut args: Vec<Expr>) -> Result<Expr> {
    let upper = name.to_ascii_uppercase();
    let unary = match upper.as_str() {
        "NOT" => Some(UnaryOp::Not),
        "IS NULL" => Some(UnaryOp::IsNull),
        "IS NOT NULL" => Some(UnaryOp::IsNotNull),
        "-" if args.len() == 1 => Some(UnaryOp::Minus),
        _ => None,
    };
    if let Some(op) = unary {
        if args.len() != 1 {
            return Err(QueryError::ExpressionError(format!(
                "{} takes one argument",
                name
            )));
        }
        let expr = Box::new(args.remove(0));
        return Ok(Expr::Unary { op, expr });
    }

    let op = BinaryOp::from_name(&upper)
        .ok_or_else(|| QueryError::ExpressionError(format!("unsupported function '{}'", name)))?;
    let variadic = matches!(op, BinaryOp::And | BinaryOp::Or);
    if args.len() < 2 || (!variadic && args.len() != 2) {
        return Err(QueryError::ExpressionError(format!(
            "'{}' takes two arguments, got {}",
            name,
            args.len()
        )));
    }
    let mut args = args.into_iter();
    let first = args.next().ok_or_else(|| {
        QueryError::ExpressionError(format!("'{}' is missing arguments", name))
    })?;
    Ok(args.fold(first, |left, right| Expr::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }))
}

/// Content of `key=[...]`, with nesting and quotes respected
fn bracketed<'a>(expression: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("{}=[", key);
    let start = expression.find(&pattern)? + pattern.len();
    let end = start + matching_close(&expression[start..], '[', ']')?;
    Some(&expression[start..end])
}

/// Byte offset of the bracket closing an already opened `open`
fn matching_close(text: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 1usize;
    let mut in_string = false;
    for (i, c) in text.char_indices() {
        match c {
            '\'' => in_string = !in_string,
            _ if in_string => {}
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas that are not nested in brackets, parentheses or quotes
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '\'' => in_string = !in_string,
            _ if in_string => {}
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = text[start..].trim();
    if !last.is_empty() {
        parts.push(last);
    }
    parts
}

/// Column indexes pushed into a scan by `projects=[[0, 2]]`; empty keeps all
pub fn get_projections(expression: &str) -> Result<Vec<usize>> {
    let Some(inner) = bracketed(expression, "projects") else {
        return Ok(Vec::new());
    };
    let list = inner.trim().trim_start_matches('[').trim_end_matches(']');
    split_top_level(list)
        .into_iter()
        .map(|index| {
            index.parse::<usize>().map_err(|_| {
                QueryError::ExpressionError(format!("invalid projection index '{}'", index))
            })
        })
        .collect()
}

/// Whether a scan carries a pushed-down filter
pub fn is_filtered_bindable_scan(expression: &str) -> bool {
    bracketed(expression, "filters").is_some()
}

/// Output names from `aliases=[[a, b]]`, falling back to `names`
pub fn fix_column_aliases(names: &[String], expression: &str) -> Vec<String> {
    let Some(inner) = bracketed(expression, "aliases") else {
        return names.to_vec();
    };
    let list = inner.trim().trim_start_matches('[').trim_end_matches(']');
    let aliases = split_top_level(list);
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            aliases
                .get(i)
                .filter(|alias| !alias.is_empty())
                .map(|alias| alias.to_string())
                .unwrap_or_else(|| name.clone())
        })
        .collect()
}

/// Predicate text from `condition=[...]` or `filters=[[...]]`
pub fn get_condition(expression: &str) -> Result<String> {
    if let Some(condition) = bracketed(expression, "condition") {
        return Ok(condition.trim().to_string());
    }
    if let Some(filters) = bracketed(expression, "filters") {
        let trimmed = filters.trim();
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(trimmed);
        return Ok(inner.trim().to_string());
    }
    Err(QueryError::ExpressionError(format!(
        "no condition in '{}'",
        expression
    )))
}

/// Named output expressions of `LogicalProject(a=[$0], b=[+($1, 1)])`
pub fn get_project_expressions(expression: &str) -> Result<Vec<(String, String)>> {
    let open = expression.find('(').ok_or_else(|| {
        QueryError::ExpressionError(format!("no projection list in '{}'", expression))
    })?;
    let body = &expression[open + 1..];
    let close = matching_close(body, '(', ')').ok_or_else(|| {
        QueryError::ExpressionError(format!("unbalanced projection list in '{}'", expression))
    })?;

    split_top_level(&body[..close])
        .into_iter()
        .map(|item| {
            let split = item.find("=[").ok_or_else(|| {
                QueryError::ExpressionError(format!("invalid projection item '{}'", item))
            })?;
            let name = item[..split].trim().to_string();
            let rest = &item[split + 2..];
            let end = matching_close(rest, '[', ']').ok_or_else(|| {
                QueryError::ExpressionError(format!("invalid projection item '{}'", item))
            })?;
            Ok((name, rest[..end].trim().to_string()))
        })
        .collect()
}
