//! SQL script execution for plugin `install.sql` / `update.sql` /
//! `uninstall.sql` scripts.

use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while running a plugin SQL script
#[derive(Debug, Error)]
pub enum SqlError {
    #[error("Failed to read SQL script {path}: {message}")]
    Read { path: String, message: String },

    #[error("SQL statement failed: {0}")]
    Statement(String),

    #[error("Database unavailable: {0}")]
    Connection(String),
}

/// Executes single SQL statements against the host database
pub trait SqlExecutor: Send + Sync {
    fn execute(&self, statement: &str) -> Result<(), SqlError>;
}

/// Run every statement of a script file. A missing file is not an error.
///
/// Comment lines (`--`, `/*`) and blank lines are skipped; lines are
/// accumulated until one ends with `;`, then the accumulated statement is
/// executed. Returns the number of statements executed.
pub fn import_sql(path: &Path, executor: &dyn SqlExecutor) -> Result<usize, SqlError> {
    if !path.is_file() {
        debug!(path = ?path, "No SQL script, skipping");
        return Ok(0);
    }
    let content = fs::read_to_string(path).map_err(|e| SqlError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut executed = 0;
    let mut statement = String::new();
    for line in content.lines() {
        if line.trim().is_empty() || line.starts_with("--") || line.starts_with("/*") {
            continue;
        }
        statement.push_str(line);
        statement.push('\n');
        if line.trim_end().ends_with(';') {
            executor.execute(statement.trim())?;
            executed += 1;
            statement.clear();
        }
    }
    info!(path = ?path, statements = executed, "Imported SQL script");
    Ok(executed)
}

/// SQLite-backed executor
pub struct SqliteExecutor {
    conn: Mutex<Connection>,
}

impl SqliteExecutor {
    pub fn open(path: &Path) -> Result<Self, SqlError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SqlError::Connection(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|e| SqlError::Connection(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, SqlError> {
        let conn = Connection::open_in_memory().map_err(|e| SqlError::Connection(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a query returning a single integer (used by tests and diagnostics)
    pub fn query_i64(&self, sql: &str) -> Result<i64, SqlError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SqlError::Connection(e.to_string()))?;
        conn.query_row(sql, [], |row| row.get(0))
            .map_err(|e| SqlError::Statement(e.to_string()))
    }
}

impl SqlExecutor for SqliteExecutor {
    fn execute(&self, statement: &str) -> Result<(), SqlError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SqlError::Connection(e.to_string()))?;
        conn.execute_batch(statement)
            .map_err(|e| SqlError::Statement(format!("{}: {}", e, statement)))
    }
}

/// Executor used when no database is configured; statements are logged and
/// skipped
pub struct NullSqlExecutor;

impl SqlExecutor for NullSqlExecutor {
    fn execute(&self, statement: &str) -> Result<(), SqlError> {
        debug!(statement = %statement, "No database configured, skipping statement");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl SqlExecutor for Recorder {
        fn execute(&self, statement: &str) -> Result<(), SqlError> {
            self.0.lock().unwrap().push(statement.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_missing_script_is_noop() {
        let dir = TempDir::new().unwrap();
        let rec = Recorder::default();
        assert_eq!(import_sql(&dir.path().join("install.sql"), &rec).unwrap(), 0);
    }

    #[test]
    fn test_statement_splitting() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("install.sql");
        fs::write(
            &script,
            "-- header\n/* block */\nCREATE TABLE t (\n  id INTEGER\n);\n\nINSERT INTO t VALUES (1);\n",
        )
        .unwrap();

        let rec = Recorder::default();
        assert_eq!(import_sql(&script, &rec).unwrap(), 2);
        let statements = rec.0.lock().unwrap();
        assert_eq!(statements[0], "CREATE TABLE t (\n  id INTEGER\n);");
        assert_eq!(statements[1], "INSERT INTO t VALUES (1);");
    }

    #[test]
    fn test_sqlite_executor_runs_script() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("install.sql");
        fs::write(
            &script,
            "CREATE TABLE shop_items (id INTEGER PRIMARY KEY, name TEXT);\nINSERT INTO shop_items (name) VALUES ('a');\nINSERT INTO shop_items (name) VALUES ('b');\n",
        )
        .unwrap();

        let db = SqliteExecutor::in_memory().unwrap();
        import_sql(&script, &db).unwrap();
        assert_eq!(db.query_i64("SELECT COUNT(*) FROM shop_items").unwrap(), 2);
    }

    #[test]
    fn test_sqlite_error_surfaces() {
        let db = SqliteExecutor::in_memory().unwrap();
        let err = db.execute("INSERT INTO missing VALUES (1);").unwrap_err();
        assert!(matches!(err, SqlError::Statement(_)));
    }
}
