//! SQL statement parameterization.
//!
//! Collapses the literal values of a statement into placeholders so that
//! database spans named after their statement keep a bounded number of
//! distinct names.

use std::convert::Infallible;
use std::fmt;
use std::ops::ControlFlow;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    BinaryOperator, Expr, SetExpr, Statement, Value, ValueWithSpan, VisitMut, VisitorMut,
};
use sqlparser::dialect::{MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Span;

use crate::error::{ParseError, UnknownDialect};

/// Placeholder written in place of literal values.
pub const PLACEHOLDER: &str = "?";

// Some query builders render decimals as `$100.50` inside VALUES, which the
// grammars read as positional parameters.
static VALUES_GROUP_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)VALUES\s*\(\s*([^)]+)\)").expect("valid VALUES regex"));

/// SQL dialects understood by the parameterizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Literals become the positional placeholder `?`.
    MySql,
    /// Literals compared against a column become the string `'?'`.
    PostgreSql,
}

impl Dialect {
    /// Returns the dialect name as used by the `db.system` span attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::MySql => "mysql",
            Dialect::PostgreSql => "postgresql",
        }
    }

    /// Map an OpenTelemetry `db.system` value to a dialect.
    ///
    /// Returns `None` for database systems without a supported grammar.
    pub fn from_db_system(db_system: &str) -> Option<Self> {
        match db_system.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Dialect::MySql),
            "postgresql" | "postgres" | "pg" => Some(Dialect::PostgreSql),
            _ => None,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = UnknownDialect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dialect::from_db_system(s).ok_or_else(|| UnknownDialect(s.to_string()))
    }
}

/// Replace every literal value in `sql` with a placeholder.
///
/// The result keeps the clauses, identifiers and join structure of the input;
/// only literal values and value lists change. Statements the dialect cannot
/// parse are reported as a [`ParseError`] that still carries the original text.
///
/// # Example
///
/// ```rust
/// use transaction_tracing::{normalize, Dialect};
///
/// let normalized = normalize(Dialect::MySql, "SELECT * FROM users WHERE id IN (1, 2, 3)").unwrap();
/// assert_eq!(normalized, "SELECT * FROM users WHERE id IN (?)");
/// ```
pub fn normalize(dialect: Dialect, sql: &str) -> Result<String, ParseError> {
    let adjusted = strip_dollars_inside_values(sql);

    let parsed = match dialect {
        Dialect::MySql => Parser::parse_sql(&MySqlDialect {}, &adjusted),
        Dialect::PostgreSql => Parser::parse_sql(&PostgreSqlDialect {}, &adjusted),
    };
    let mut statements = parsed.map_err(|source| ParseError::Syntax {
        original: sql.to_string(),
        source,
    })?;
    if statements.is_empty() {
        return Err(ParseError::Empty {
            original: sql.to_string(),
        });
    }

    for statement in statements.iter_mut() {
        let _ = match dialect {
            Dialect::MySql => statement.visit(&mut MySqlRewriter),
            Dialect::PostgreSql => statement.visit(&mut PostgresRewriter),
        };
    }

    Ok(statements
        .iter()
        .map(Statement::to_string)
        .collect::<Vec<_>>()
        .join("; "))
}

/// Name a database span after its parameterized statement.
///
/// Falls back to `method` when the statement is empty or cannot be parsed.
pub fn format_span_name(dialect: Dialect, method: &str, sql: &str) -> String {
    if sql.trim().is_empty() {
        return method.to_string();
    }

    match normalize(dialect, sql) {
        Ok(normalized) => normalized,
        Err(e) => {
            tracing::debug!(
                target: "transaction_tracing",
                dialect = %dialect,
                error = %e,
                "Statement could not be parameterized, using fallback span name"
            );
            method.to_string()
        }
    }
}

fn strip_dollars_inside_values(sql: &str) -> std::borrow::Cow<'_, str> {
    if !sql.contains('$') {
        return std::borrow::Cow::Borrowed(sql);
    }
    VALUES_GROUP_REGEX.replace_all(sql, |caps: &regex::Captures<'_>| caps[0].replace('$', ""))
}

fn is_column_like(expr: &Expr) -> bool {
    match expr {
        Expr::Nested(inner) => is_column_like(inner),
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => true,
        _ => false,
    }
}

fn is_comparison(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
    )
}

fn positional_placeholder() -> Expr {
    Expr::Value(ValueWithSpan {
        value: Value::Placeholder(PLACEHOLDER.to_string()),
        span: Span::empty(),
    })
}

fn quoted_placeholder() -> Expr {
    Expr::Value(ValueWithSpan {
        value: Value::SingleQuotedString(PLACEHOLDER.to_string()),
        span: Span::empty(),
    })
}

/// Positional placeholders for every literal, IN lists cut to one element.
struct MySqlRewriter;

impl VisitorMut for MySqlRewriter {
    type Break = Infallible;

    fn pre_visit_statement(&mut self, statement: &mut Statement) -> ControlFlow<Self::Break> {
        if let Statement::Insert(insert) = statement {
            if let Some(source) = insert.source.as_mut() {
                if let SetExpr::Values(values) = source.body.as_mut() {
                    values
                        .rows
                        .iter_mut()
                        .flat_map(|row| row.iter_mut())
                        .filter(|expr| is_column_like(expr))
                        .for_each(|expr| *expr = positional_placeholder());
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Value(ValueWithSpan { value, .. }) => {
                if !matches!(value, Value::Null | Value::Boolean(_) | Value::Placeholder(_)) {
                    *value = Value::Placeholder(PLACEHOLDER.to_string());
                }
            }
            Expr::InList { list, .. } => list.truncate(1),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// Quoted placeholders for whatever a column is compared against.
struct PostgresRewriter;

impl VisitorMut for PostgresRewriter {
    type Break = Infallible;

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::BinaryOp { left, op, right } if is_comparison(op) => {
                let left_is_column = is_column_like(left);
                let right_is_column = is_column_like(right);
                if left_is_column && !right_is_column {
                    **right = quoted_placeholder();
                }
                if right_is_column && !left_is_column {
                    **left = quoted_placeholder();
                }
            }
            Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
                if is_column_like(expr) && !is_column_like(pattern) {
                    **pattern = quoted_placeholder();
                }
            }
            Expr::InList { expr, list, .. } => {
                if is_column_like(expr) && !list.iter().all(is_column_like) {
                    *list = vec![quoted_placeholder()];
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
