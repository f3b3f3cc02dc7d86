//! Scalar expressions used by `eval` and `select`, and date expressions used in term values.
//!
//! Both languages are pluggable: the factory only talks to the [`ExpressionParser`] and
//! [`DateExpressionParser`] traits. The implementations here cover function calls, infix
//! arithmetic and comparison, and the date-point functions with duration offsets.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::error::ExpressionError;
use crate::token::{Node, TokenKind};

/// Date handling settings for a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DateTimeSettings {
    /// The time `now()` refers to. Defaults to the current time.
    pub reference_time: Option<DateTime<Utc>>,
}

impl DateTimeSettings {
    pub fn with_reference_time(reference_time: DateTime<Utc>) -> Self {
        Self {
            reference_time: Some(reference_time),
        }
    }

    pub fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time.unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionContext {
    pub date_time_settings: DateTimeSettings,
}

/// Fields referenced by compiled expressions, in first-use order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldIndex {
    fields: Vec<String>,
    positions: HashMap<String, usize>,
}

impl FieldIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the position of `name`, adding it if it has not been seen before.
    pub fn create(&mut self, name: &str) -> usize {
        if let Some(position) = self.positions.get(name) {
            return *position;
        }
        let position = self.fields.len();
        self.fields.push(name.to_string());
        self.positions.insert(name.to_string(), position);
        position
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
    Power,
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
}

impl BinaryOp {
    fn from_kind(kind: TokenKind) -> Option<Self> {
        Some(match kind {
            TokenKind::Plus => BinaryOp::Add,
            TokenKind::Minus => BinaryOp::Subtract,
            TokenKind::Multiplication => BinaryOp::Multiply,
            TokenKind::Division => BinaryOp::Divide,
            TokenKind::Modulus => BinaryOp::Modulus,
            TokenKind::Order => BinaryOp::Power,
            TokenKind::Equals => BinaryOp::Equals,
            TokenKind::NotEquals => BinaryOp::NotEquals,
            TokenKind::GreaterThan => BinaryOp::GreaterThan,
            TokenKind::GreaterThanOrEqualTo => BinaryOp::GreaterThanOrEqualTo,
            TokenKind::LessThan => BinaryOp::LessThan,
            TokenKind::LessThanOrEqualTo => BinaryOp::LessThanOrEqualTo,
            _ => return None,
        })
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Equals
            | BinaryOp::NotEquals
            | BinaryOp::GreaterThan
            | BinaryOp::GreaterThanOrEqualTo
            | BinaryOp::LessThan
            | BinaryOp::LessThanOrEqualTo => 1,
            BinaryOp::Add | BinaryOp::Subtract => 2,
            BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulus => 3,
            BinaryOp::Power => 4,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulus => "%",
            BinaryOp::Power => "^",
            BinaryOp::Equals => "=",
            BinaryOp::NotEquals => "!=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqualTo => ">=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqualTo => "<=",
        }
    }
}

/// A compiled scalar expression. Renders in the `${field}` form result columns use.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Field(String),
    Str(String),
    Number(String),
    Function { name: String, args: Vec<Expression> },
    Negate(Box<Expression>),
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Field(name) => write!(f, "${{{name}}}"),
            Expression::Str(value) => write!(f, "'{}'", value.replace('\'', "\\'")),
            Expression::Number(value) => f.write_str(value),
            Expression::Function { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            Expression::Negate(inner) => match inner.as_ref() {
                Expression::Binary { .. } => write!(f, "-({inner})"),
                _ => write!(f, "-{inner}"),
            },
            Expression::Binary { op, left, right } => {
                write_operand(f, left)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, right)
            }
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, operand: &Expression) -> fmt::Result {
    match operand {
        Expression::Binary { .. } => write!(f, "({operand})"),
        _ => write!(f, "{operand}"),
    }
}

/// Expressions registered by `eval`, substituted wherever their name is referenced.
pub type EvalMap = HashMap<String, Expression>;

/// Compiles scalar sub-expressions for `eval` and `select`.
pub trait ExpressionParser: Send + Sync {
    fn parse(
        &self,
        context: &ExpressionContext,
        field_index: &mut FieldIndex,
        evals: &EvalMap,
        nodes: &[Node<'_>],
    ) -> Result<Expression, ExpressionError>;
}

/// Parses function calls, literals, field references and infix operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionExpressionParser;

impl ExpressionParser for FunctionExpressionParser {
    fn parse(
        &self,
        _context: &ExpressionContext,
        field_index: &mut FieldIndex,
        evals: &EvalMap,
        nodes: &[Node<'_>],
    ) -> Result<Expression, ExpressionError> {
        let mut cursor = Cursor {
            nodes,
            position: 0,
            evals,
            field_index,
        };
        let expression = cursor.parse_binary(0)?;
        if let Some(node) = cursor.peek() {
            return Err(ExpressionError::new(format!(
                "Unexpected token '{}'",
                node.text()
            )));
        }
        Ok(expression)
    }
}

struct Cursor<'n, 'a, 'e> {
    nodes: &'n [Node<'a>],
    position: usize,
    evals: &'e EvalMap,
    field_index: &'e mut FieldIndex,
}

impl<'n, 'a, 'e> Cursor<'n, 'a, 'e> {
    fn peek(&self) -> Option<&'n Node<'a>> {
        self.nodes.get(self.position)
    }

    fn advance(&mut self) -> Option<&'n Node<'a>> {
        let node = self.nodes.get(self.position);
        if node.is_some() {
            self.position += 1;
        }
        node
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_operand()?;

        while let Some(op) = self.peek().and_then(|node| BinaryOp::from_kind(node.kind())) {
            let precedence = op.precedence();
            if precedence < min_precedence {
                break;
            }
            self.advance();

            // `^` is right associative.
            let next = if op == BinaryOp::Power {
                precedence
            } else {
                precedence + 1
            };
            let right = self.parse_binary(next)?;
            left = Expression::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Expression, ExpressionError> {
        let Some(node) = self.advance() else {
            return Err(ExpressionError::new("Expected expression"));
        };

        match node {
            Node::Group(group) => match group.function_name() {
                Some(name) => {
                    let mut args = Vec::new();
                    for segment in split_arguments(group.children())? {
                        args.push(self.parse_nested(segment)?);
                    }
                    Ok(Expression::Function {
                        name: name.to_string(),
                        args,
                    })
                }
                None if group.token_kind() == TokenKind::TokenGroup => self.parse_nested(group.children()),
                None => Err(ExpressionError::new(format!(
                    "Unexpected token '{}'",
                    group.text()
                ))),
            },
            Node::Token(token) => match token.kind {
                TokenKind::Minus => Ok(Expression::Negate(Box::new(self.parse_binary(5)?))),
                TokenKind::Plus => self.parse_binary(5),
                TokenKind::Number => Ok(Expression::Number(token.slice().to_string())),
                TokenKind::SingleQuotedString | TokenKind::DoubleQuotedString => {
                    Ok(Expression::Str(token.unescaped().to_string()))
                }
                TokenKind::Duration | TokenKind::DateTime => Ok(Expression::Str(token.slice().to_string())),
                TokenKind::String => Ok(self.reference(token.slice())),
                TokenKind::Param => {
                    let name = token
                        .slice()
                        .trim_start_matches("${")
                        .trim_end_matches('}');
                    Ok(self.reference(name))
                }
                _ => Err(ExpressionError::new(format!(
                    "Unexpected token '{}'",
                    token.slice()
                ))),
            },
        }
    }

    fn parse_nested(&mut self, nodes: &[Node<'a>]) -> Result<Expression, ExpressionError> {
        let mut nested = Cursor {
            nodes,
            position: 0,
            evals: self.evals,
            field_index: &mut *self.field_index,
        };
        let expression = nested.parse_binary(0)?;
        if let Some(node) = nested.peek() {
            return Err(ExpressionError::new(format!(
                "Unexpected token '{}'",
                node.text()
            )));
        }
        Ok(expression)
    }

    /// A name is either an eval variable or a field.
    fn reference(&mut self, name: &str) -> Expression {
        if let Some(expression) = self.evals.get(name) {
            return expression.clone();
        }
        self.field_index.create(name);
        Expression::Field(name.to_string())
    }
}

fn split_arguments<'n, 'a>(children: &'n [Node<'a>]) -> Result<Vec<&'n [Node<'a>]>, ExpressionError> {
    if children.is_empty() {
        return Ok(Vec::new());
    }
    let segments: Vec<&[Node<'a>]> = children
        .split(|node| node.kind() == TokenKind::Comma)
        .collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(ExpressionError::new("Expected function argument"));
    }
    Ok(segments)
}

/// The functions a date expression may start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePoint {
    Now,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl DatePoint {
    pub const ALL: [DatePoint; 8] = [
        DatePoint::Now,
        DatePoint::Second,
        DatePoint::Minute,
        DatePoint::Hour,
        DatePoint::Day,
        DatePoint::Week,
        DatePoint::Month,
        DatePoint::Year,
    ];

    pub fn function(self) -> &'static str {
        match self {
            DatePoint::Now => "now()",
            DatePoint::Second => "second()",
            DatePoint::Minute => "minute()",
            DatePoint::Hour => "hour()",
            DatePoint::Day => "day()",
            DatePoint::Week => "week()",
            DatePoint::Month => "month()",
            DatePoint::Year => "year()",
        }
    }

    /// Matches the full call text, e.g. `day()`.
    pub fn from_function(text: &str) -> Option<Self> {
        DatePoint::ALL.into_iter().find(|point| point.function() == text)
    }

    /// The start of the period containing `time`.
    pub fn resolve(self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = time.date_naive();
        let start_of = |date: chrono::NaiveDate| {
            date.and_hms_opt(0, 0, 0)
                .map(|naive| Utc.from_utc_datetime(&naive))
        };
        match self {
            DatePoint::Now => Some(time),
            DatePoint::Second => time.with_nanosecond(0),
            DatePoint::Minute => time.with_nanosecond(0)?.with_second(0),
            DatePoint::Hour => time.with_nanosecond(0)?.with_second(0)?.with_minute(0),
            DatePoint::Day => start_of(date),
            DatePoint::Week => {
                let offset = i64::from(date.weekday().num_days_from_monday());
                start_of(date - Duration::days(offset))
            }
            DatePoint::Month => start_of(date.with_day(1)?),
            DatePoint::Year => start_of(date.with_day(1)?.with_month(1)?),
        }
    }
}

/// Validates and evaluates date expressions such as `day() - 1d` or
/// `2024-01-01T00:00:00Z + 12h`.
pub trait DateExpressionParser: Send + Sync {
    fn parse(&self, nodes: &[Node<'_>], settings: &DateTimeSettings) -> Result<DateTime<Utc>, ExpressionError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicDateExpressionParser;

impl DateExpressionParser for BasicDateExpressionParser {
    fn parse(&self, nodes: &[Node<'_>], settings: &DateTimeSettings) -> Result<DateTime<Utc>, ExpressionError> {
        let reference = settings.reference_time();
        let mut rest = nodes;

        let mut time = match rest.first() {
            Some(Node::Group(group)) if group.function_name().is_some() => {
                rest = &rest[1..];
                let point = DatePoint::from_function(group.text()).ok_or_else(|| {
                    ExpressionError::new(format!("Unknown date function '{}'", group.text()))
                })?;
                point
                    .resolve(reference)
                    .ok_or_else(|| ExpressionError::new("Date out of range"))?
            }
            Some(Node::Token(token)) if token.kind == TokenKind::DateTime => {
                rest = &rest[1..];
                parse_date_time(token.slice())?
            }
            Some(_) => reference,
            None => return Err(ExpressionError::new("Expected date expression")),
        };

        while let Some(first) = rest.first() {
            let (sign, duration) = match first.kind() {
                TokenKind::Plus => (1, rest.get(1)),
                TokenKind::Minus => (-1, rest.get(1)),
                TokenKind::Duration => (1, Some(first)),
                _ => {
                    return Err(ExpressionError::new(format!(
                        "Unexpected token '{}' in date expression",
                        first.text()
                    )))
                }
            };
            let Some(duration) = duration.filter(|node| node.kind() == TokenKind::Duration) else {
                return Err(ExpressionError::new("Expected duration"));
            };
            time = offset(time, duration.text(), sign)?;
            rest = &rest[if first.kind() == TokenKind::Duration { 1 } else { 2 }..];
        }

        Ok(time)
    }
}

fn parse_date_time(text: &str) -> Result<DateTime<Utc>, ExpressionError> {
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Ok(time.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| ExpressionError::new(format!("Invalid date '{text}': {e}")))
}

/// Applies a duration literal such as `10m` or `2M` to `time`.
fn offset(time: DateTime<Utc>, duration: &str, sign: i64) -> Result<DateTime<Utc>, ExpressionError> {
    let digits = duration
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(duration.len());
    let (amount, unit) = duration.split_at(digits);
    let amount: i64 = amount
        .parse()
        .map_err(|_| ExpressionError::new(format!("Invalid duration '{duration}'")))?;

    let out_of_range = || ExpressionError::new("Date out of range");
    let months = |count: i64| -> Result<DateTime<Utc>, ExpressionError> {
        let months = Months::new(u32::try_from(count).map_err(|_| out_of_range())?);
        if sign < 0 {
            time.checked_sub_months(months)
        } else {
            time.checked_add_months(months)
        }
        .ok_or_else(out_of_range)
    };

    let delta = match unit {
        "ns" => Duration::nanoseconds(amount),
        "ms" => Duration::milliseconds(amount),
        "s" => Duration::seconds(amount),
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        "w" => Duration::weeks(amount),
        "M" => return months(amount),
        "y" => return months(amount.checked_mul(12).ok_or_else(out_of_range)?),
        _ => return Err(ExpressionError::new(format!("Invalid duration '{duration}'"))),
    };
    let delta = if sign < 0 { -delta } else { delta };
    time.checked_add_signed(delta).ok_or_else(out_of_range)
}
