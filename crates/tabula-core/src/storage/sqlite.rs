//! Read-only query execution over a SQLite file
//!
//! Each statement gets its own read-only connection on the blocking pool. If the
//! awaiting future is dropped (cancellation, timeout) the running statement is
//! interrupted through the connection's interrupt handle.

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::capability::QueryExecutor;
use crate::config::{DatabaseSettings, WorkflowConfig};
use crate::error::ExecutionError;
use crate::types::RowSet;

/// Interrupts the statement on drop unless disarmed
struct InterruptGuard {
    handle: Option<InterruptHandle>,
}

impl InterruptGuard {
    fn new(handle: InterruptHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Interrupting in-flight statement");
            handle.interrupt();
        }
    }
}

/// Open a read-only connection
pub(crate) fn open_read_only(path: &Path, busy_timeout: Duration) -> Result<Connection, ExecutionError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| ExecutionError::Open(format!("{}: {}", path.display(), e)))?;

    conn.busy_timeout(busy_timeout)
        .map_err(|e| ExecutionError::Open(e.to_string()))?;
    Ok(conn)
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}

fn classify(err: rusqlite::Error) -> ExecutionError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::OperationInterrupted =>
        {
            ExecutionError::Interrupted
        }
        _ => ExecutionError::Engine(err.to_string()),
    }
}

/// Run one statement, reading at most `max_rows` rows
pub(crate) fn run_query(
    conn: &Connection,
    statement: &str,
    max_rows: usize,
) -> Result<RowSet, ExecutionError> {
    let mut stmt = conn
        .prepare(statement)
        .map_err(|e| ExecutionError::Syntax(e.to_string()))?;

    if !stmt.readonly() {
        return Err(ExecutionError::Unsafe(
            "statement would modify the database".to_string(),
        ));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = Vec::new();
    let mut truncated = false;
    let mut cursor = stmt.query([]).map_err(classify)?;
    while let Some(row) = cursor.next().map_err(classify)? {
        if rows.len() >= max_rows {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(value_to_json(row.get_ref(idx).map_err(classify)?));
        }
        rows.push(values);
    }

    Ok(RowSet {
        columns,
        rows,
        truncated,
    })
}

/// Read-only [`QueryExecutor`] over a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    path: PathBuf,
    max_rows: usize,
    busy_timeout: Duration,
    statement_timeout: Option<Duration>,
}

impl SqliteExecutor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_rows: 1000,
            busy_timeout: Duration::from_secs(5),
            statement_timeout: None,
        }
    }

    pub fn from_settings(database: &DatabaseSettings, workflow: &WorkflowConfig) -> Self {
        Self::new(database.path.clone())
            .with_max_rows(workflow.max_result_rows)
            .with_busy_timeout(database.busy_timeout())
            .with_statement_timeout(database.statement_timeout())
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fail early if the database cannot be opened
    pub fn check(&self) -> Result<(), ExecutionError> {
        let conn = open_read_only(&self.path, self.busy_timeout)?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| ExecutionError::Open(e.to_string()))
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn execute(&self, statement: &str) -> Result<RowSet, ExecutionError> {
        let conn = open_read_only(&self.path, self.busy_timeout)?;
        let guard = InterruptGuard::new(conn.get_interrupt_handle());

        let statement = statement.to_string();
        let max_rows = self.max_rows;
        let task = tokio::task::spawn_blocking(move || run_query(&conn, &statement, max_rows));

        let joined = match self.statement_timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => return Err(ExecutionError::Timeout(limit.as_millis() as u64)),
            },
            None => task.await,
        };
        guard.disarm();

        joined.map_err(|e| ExecutionError::Engine(format!("execution task failed: {}", e)))?
    }
}
