#![forbid(unsafe_code)]
//! Durable job store: a single-file SQLite database shared by the control
//! surface and every worker process, plus the on-disk queue configuration.

mod store;

pub use store::config::QueueConfig;
pub use store::error::StoreError;
pub use store::support::{ms_to_rfc3339, now_ms, rfc3339_to_ms};
pub use store::types::*;
pub use store::SqliteStore;
