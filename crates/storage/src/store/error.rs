#![forbid(unsafe_code)]

use rusqlite::ErrorCode;

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidSpec(String),
    DuplicateId { id: String },
    NotFound { id: String },
    NotDead { id: String, state: String },
    NotProcessing { id: String, state: String },
    Busy,
    Corrupt(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) | Self::Sql(_) => "INTERNAL",
            Self::InvalidSpec(_) => "INVALID_SPEC",
            Self::DuplicateId { .. } => "DUPLICATE_ID",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::NotDead { .. } => "NOT_DEAD",
            Self::NotProcessing { .. } => "NOT_PROCESSING",
            Self::Busy => "STORE_BUSY",
            Self::Corrupt(_) => "STORE_CORRUPT",
        }
    }

    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidSpec(_) => 2,
            Self::DuplicateId { .. } => 3,
            Self::NotDead { .. } => 4,
            Self::NotFound { .. } => 5,
            _ => 1,
        }
    }

    /// Transient contention: the caller may retry after a short backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::InvalidSpec(message) => write!(f, "invalid job spec: {message}"),
            Self::DuplicateId { id } => write!(f, "job already exists: {id}"),
            Self::NotFound { id } => write!(f, "job not found: {id}"),
            Self::NotDead { id, state } => {
                write!(f, "job {id} is not in the dead-letter queue (state={state})")
            }
            Self::NotProcessing { id, state } => {
                write!(f, "job {id} is not processing (state={state})")
            }
            Self::Busy => write!(f, "store busy: write lock contended beyond busy-wait"),
            Self::Corrupt(message) => write!(f, "store corrupt: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, ref message) = value {
            match err.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => return Self::Busy,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    return Self::Corrupt(
                        message.clone().unwrap_or_else(|| err.to_string()),
                    );
                }
                _ => {}
            }
        }
        Self::Sql(value)
    }
}
