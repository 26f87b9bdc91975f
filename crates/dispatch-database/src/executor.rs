//! Async SQLite executor using a dedicated background thread.
//!
//! Every worker shares one [`AsyncDatabase`]. Closures passed to
//! [`AsyncDatabase::call`] run in FIFO order on the SQLite thread, which keeps
//! the Tokio runtime free and serializes writes the way SQLite wants them.
//!
//! Keep closures to SQL and row mapping. Anything slow inside `call()` stalls
//! every other worker's queries.

use crate::{migrations, DatabaseError, DatabaseResult};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

const FILE_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA temp_store = MEMORY;
    PRAGMA busy_timeout = 5000;
";

const MEMORY_PRAGMAS: &str = "
    PRAGMA foreign_keys = ON;
    PRAGMA temp_store = MEMORY;
";

/// Convert a tokio_rusqlite::Error to DatabaseError.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::ConnectionClosed => {
            DatabaseError::Connection("Connection closed".to_string())
        }
        other => DatabaseError::Connection(other.to_string()),
    }
}

/// Async SQLite database with a dedicated executor thread.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
}

impl AsyncDatabase {
    /// Open (or create) a database file, enable WAL and run pending migrations.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let path_str = path.to_string_lossy().to_string();
        info!(path = %path_str, "Opening database");

        let conn = Connection::open(path)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let db = Self {
            conn,
            path: path_str,
        };
        db.initialize(FILE_PRAGMAS).await?;

        info!(path = %db.path, "Database initialized with WAL mode");
        Ok(db)
    }

    /// Open a private in-memory database with the full schema.
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let db = Self {
            conn,
            path: ":memory:".to_string(),
        };
        db.initialize(MEMORY_PRAGMAS).await?;
        Ok(db)
    }

    async fn initialize(&self, pragmas: &'static str) -> DatabaseResult<()> {
        self.call(move |conn| {
            conn.execute_batch(pragmas)?;
            migrations::run_migrations(conn)
        })
        .await
    }

    /// Execute a closure on the database connection.
    ///
    /// The closure runs on the dedicated SQLite thread; the caller's task is
    /// parked, not blocked, until the result is ready.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        // Our result rides inside tokio_rusqlite's Ok so both layers of errors
        // survive the trip back.
        let outer = self.conn.call(move |conn| Ok(f(conn))).await;

        match outer {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Get the database file path (`:memory:` for in-memory databases).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check the executor thread is alive by running a trivial query.
    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(())
        })
        .await?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Close the connection after pending operations complete.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to close database: {e:?}")))?;
        info!(path = %self.path, "Database closed");
        Ok(())
    }
}
