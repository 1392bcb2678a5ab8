//! SeaORM connection wrapper naming database spans after their parameterized
//! statement.

use std::future::Future;

use async_trait::async_trait;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbBackend, DbErr, ExecResult, QueryResult, Statement,
};
use tracing::{field, Instrument, Span};

use crate::parser::{format_span_name, Dialect};

const OPERATIONS: [&str; 13] = [
    "SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "TRUNCATE", "BEGIN",
    "COMMIT", "ROLLBACK", "SET", "WITH",
];

/// Leading SQL keyword of a statement, used as the span name when the
/// statement cannot be parameterized.
pub fn operation_name(sql: &str) -> &'static str {
    let keyword = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match OPERATIONS.iter().find(|op| **op == keyword) {
        Some(&"WITH") => "SELECT",
        Some(op) => *op,
        None => "QUERY",
    }
}

/// A traced wrapper around SeaORM's `DatabaseConnection`.
///
/// Every statement runs inside a `db.query` span whose `otel.name` is the
/// statement with its literal values replaced by placeholders, so spans of
/// the same query shape share one name. SQLite connections, and statements
/// the dialect cannot parse, fall back to the leading SQL keyword.
///
/// # Example
///
/// ```rust,ignore
/// use sea_orm::Database;
/// use transaction_tracing::TracedConnection;
///
/// let db = Database::connect("postgres://localhost/mydb").await?;
/// let traced = TracedConnection::from(db);
///
/// // Named "SELECT * FROM users WHERE id = '?'"
/// traced.query_one(Statement::from_string(DbBackend::Postgres, "SELECT * FROM users WHERE id = 7")).await?;
/// ```
#[derive(Debug, Clone)]
pub struct TracedConnection {
    inner: DatabaseConnection,
}

impl TracedConnection {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { inner: connection }
    }

    /// Get a reference to the underlying `DatabaseConnection`.
    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }

    /// Consume the wrapper and return the inner `DatabaseConnection`.
    pub fn into_inner(self) -> DatabaseConnection {
        self.inner
    }

    fn dialect(&self) -> Option<Dialect> {
        match self.inner.get_database_backend() {
            DbBackend::Postgres => Some(Dialect::PostgreSql),
            DbBackend::MySql => Some(Dialect::MySql),
            DbBackend::Sqlite => None,
        }
    }

    fn db_system(&self) -> &'static str {
        match self.inner.get_database_backend() {
            DbBackend::Postgres => "postgresql",
            DbBackend::MySql => "mysql",
            DbBackend::Sqlite => "sqlite",
        }
    }

    /// Span name for `sql` on this connection's backend.
    pub fn span_name(&self, sql: &str) -> String {
        let operation = operation_name(sql);
        match self.dialect() {
            Some(dialect) => format_span_name(dialect, operation, sql),
            None => operation.to_string(),
        }
    }

    fn create_span(&self, sql: &str) -> Span {
        tracing::info_span!(
            "db.query",
            otel.name = %self.span_name(sql),
            otel.kind = "client",
            db.system = %self.db_system(),
            db.operation = %operation_name(sql),
            otel.status_code = field::Empty,
            error.message = field::Empty,
        )
    }

    async fn traced<T, F>(&self, sql: &str, query: F) -> Result<T, DbErr>
    where
        F: Future<Output = Result<T, DbErr>>,
    {
        let span = self.create_span(sql);
        let result = query.instrument(span.clone()).await;

        match &result {
            Ok(_) => {
                span.record("otel.status_code", "OK");
            }
            Err(e) => {
                span.record("otel.status_code", "ERROR");
                span.record("error.message", e.to_string().as_str());
                tracing::error!(parent: &span, error = %e, "Database query failed");
            }
        }

        result
    }
}

impl From<DatabaseConnection> for TracedConnection {
    fn from(connection: DatabaseConnection) -> Self {
        Self::new(connection)
    }
}

impl AsRef<DatabaseConnection> for TracedConnection {
    fn as_ref(&self) -> &DatabaseConnection {
        &self.inner
    }
}

#[async_trait]
impl ConnectionTrait for TracedConnection {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let sql = stmt.sql.clone();
        self.traced(&sql, self.inner.execute(stmt)).await
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        self.traced(sql, self.inner.execute_unprepared(sql)).await
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let sql = stmt.sql.clone();
        self.traced(&sql, self.inner.query_one(stmt)).await
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let sql = stmt.sql.clone();
        self.traced(&sql, self.inner.query_all(stmt)).await
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

/// Extension trait for easy wrapping of database connections.
pub trait TracingExt {
    /// Wrap this connection so its spans are named after parameterized statements.
    fn with_tracing(self) -> TracedConnection;
}

impl TracingExt for DatabaseConnection {
    fn with_tracing(self) -> TracedConnection {
        TracedConnection::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{MockDatabase, MockExecResult};

    #[test]
    fn test_operation_name() {
        assert_eq!(operation_name("select * from users"), "SELECT");
        assert_eq!(operation_name("  INSERT INTO t VALUES (1)"), "INSERT");
        assert_eq!(operation_name("WITH cte AS (SELECT 1) SELECT * FROM cte"), "SELECT");
        assert_eq!(operation_name("VACUUM"), "QUERY");
        assert_eq!(operation_name(""), "QUERY");
    }

    #[test]
    fn test_span_name_per_backend() {
        let postgres = MockDatabase::new(DbBackend::Postgres).into_connection().with_tracing();
        assert_eq!(
            postgres.span_name("SELECT * FROM users WHERE id = 7"),
            "SELECT * FROM users WHERE id = '?'"
        );
        assert_eq!(postgres.span_name("SELECT * FROM"), "SELECT");

        let mysql = MockDatabase::new(DbBackend::MySql).into_connection().with_tracing();
        assert_eq!(
            mysql.span_name("SELECT * FROM users WHERE id IN (1, 2, 3)"),
            "SELECT * FROM users WHERE id IN (?)"
        );

        let sqlite = MockDatabase::new(DbBackend::Sqlite).into_connection().with_tracing();
        assert_eq!(sqlite.span_name("DELETE FROM users WHERE id = 1"), "DELETE");
    }

    #[tokio::test]
    async fn test_execute_passes_through_result() {
        let db = MockDatabase::new(DbBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 3,
            }])
            .into_connection();
        let traced = TracedConnection::from(db);

        let result = traced
            .execute(Statement::from_string(
                DbBackend::Postgres,
                "UPDATE users SET active = false WHERE age > 90",
            ))
            .await
            .unwrap();
        assert_eq!(result.rows_affected(), 3);
        assert!(traced.is_mock_connection());
    }
}
