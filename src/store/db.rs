//! SQLite database handle — connection wrapper, pragmas, and migrations.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

/// Shared database handle wrapping a SQLite connection behind a Mutex.
///
/// Using `Mutex` (not `RwLock`) because rusqlite `Connection` is `!Sync`.
/// Workers and request handlers serialize their statements through it; the
/// busy-timeout pragma covers the multi-process case.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path, apply the
    /// concurrency pragmas, and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, rusqlite::Error> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                    Some(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    )),
                )
            })?;
        }

        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.apply_pragmas()?;
        db.run_migrations()?;
        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.apply_pragmas()?;
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a lock on the underlying connection.
    ///
    /// Callers hold the lock for the duration of their DB operation.
    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("Database mutex poisoned")
    }

    /// The SQLite library version, for the health endpoint.
    pub fn sqlite_version(&self) -> Result<String, rusqlite::Error> {
        self.conn()
            .query_row("SELECT sqlite_version()", [], |row| row.get(0))
    }

    /// WAL + busy-timeout discipline for concurrent writers. Recovery repairs
    /// in-flight state after a crash, so `synchronous=NORMAL` is enough.
    fn apply_pragmas(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn();
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    }

    /// Run all schema migrations.
    fn run_migrations(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS executions (
                execution_id        TEXT PRIMARY KEY,
                agent_id            TEXT NOT NULL,
                status              TEXT NOT NULL,
                parent_execution_id TEXT,
                final_result        TEXT,
                base_priority       INTEGER NOT NULL,
                priority            INTEGER NOT NULL,
                enqueue_ts          INTEGER NOT NULL,
                lease_id            TEXT,
                lease_expires_at    INTEGER,
                created_at          INTEGER NOT NULL,
                started_at          INTEGER,
                completed_at        INTEGER,
                error_log           TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_executions_queue
                ON executions (status, priority DESC, enqueue_ts ASC);

            CREATE TABLE IF NOT EXISTS inference_queue (
                task_id            TEXT PRIMARY KEY,
                model_id           TEXT NOT NULL,
                status             TEXT NOT NULL,
                prompt             TEXT NOT NULL,
                parameters         TEXT NOT NULL,
                result             TEXT,
                base_priority      INTEGER NOT NULL,
                priority           INTEGER NOT NULL,
                enqueue_ts         INTEGER NOT NULL,
                lease_id           TEXT,
                lease_expires_at   INTEGER,
                created_at         INTEGER NOT NULL,
                started_at         INTEGER,
                completed_at       INTEGER,
                tokens_per_second  REAL,
                error_log          TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_inference_queue
                ON inference_queue (status, priority DESC, enqueue_ts ASC);

            CREATE TABLE IF NOT EXISTS node_events (
                event_id            INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id        TEXT NOT NULL,
                node_id             TEXT NOT NULL,
                status              TEXT NOT NULL,
                intermediate_output TEXT,
                started_at          INTEGER,
                completed_at        INTEGER,
                error_log           TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_node_events_exec
                ON node_events (execution_id, event_id);",
        )?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_creates_tables() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
                 AND name IN ('executions', 'inference_queue', 'node_events')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn open_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("dir").join("engine.db");
        let db = Database::open(&db_path).unwrap();
        assert!(db_path.exists());
        drop(db);
    }

    #[test]
    fn wal_mode_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open(tmp.path().join("engine.db")).unwrap();
        let mode: String = db
            .conn()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn busy_timeout_applied() {
        let db = Database::open_in_memory().unwrap();
        let timeout: i64 = db
            .conn()
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 5000);
    }

    #[test]
    fn migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
    }

    #[test]
    fn sqlite_version_is_nonempty() {
        let db = Database::open_in_memory().unwrap();
        let version = db.sqlite_version().unwrap();
        assert!(!version.is_empty());
    }
}
