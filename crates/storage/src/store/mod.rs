#![forbid(unsafe_code)]
//! Store implementation (split-friendly module root).

pub(crate) mod config;
pub(crate) mod error;
mod jobs;
pub(crate) mod support;
pub(crate) mod types;

use error::StoreError;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};

pub const DB_FILE_NAME: &str = "queue.db";
pub const LOGS_DIR_NAME: &str = "logs";

/// How long a writer waits for the database write lock before the store
/// reports `Busy`. Sized for a handful of workers contending on claims.
const BUSY_TIMEOUT_MS: u32 = 5_000;

#[derive(Debug)]
pub struct SqliteStore {
    data_dir: PathBuf,
    conn: Connection,
}

impl SqliteStore {
    /// Open (and initialize, if empty) the queue database under `data_dir`.
    /// Idempotent: safe to call from every process on every start.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        let conn = Connection::open(Self::db_path(&data_dir))?;
        let store = Self { data_dir, conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn db_path(data_dir: &Path) -> PathBuf {
        data_dir.join(DB_FILE_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join(LOGS_DIR_NAME)
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        self.logs_dir().join(format!("job_{job_id}.log"))
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout={BUSY_TIMEOUT_MS};

            CREATE TABLE IF NOT EXISTS jobs (
              id TEXT PRIMARY KEY,
              command TEXT NOT NULL,
              state TEXT NOT NULL,
              attempts INTEGER NOT NULL DEFAULT 0,
              max_retries INTEGER NOT NULL DEFAULT 3,
              base_backoff REAL NOT NULL DEFAULT 2.0,
              priority INTEGER NOT NULL DEFAULT 0,
              timeout_seconds REAL,
              stdout_log TEXT NOT NULL,
              last_error TEXT,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              available_at_ms INTEGER NOT NULL,
              started_at_ms INTEGER,
              finished_at_ms INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state_available
              ON jobs(state, available_at_ms);
            "#
        ))?;
        Ok(())
    }

    /// Write transaction that takes the database write lock at BEGIN, so a
    /// select-then-update pair can never lose a race to another process.
    /// Fails `Busy` when the lock is still contended after the busy-wait.
    fn txn_immediate(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}
