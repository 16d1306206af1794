//! Persisted dataset and incremental merge
//!
//! # Components
//!
//! - `Record` / `Dataset`: in-memory rows keyed by a unique field
//! - `DatasetStore`: backend trait with CSV and SQLite implementations
//! - `IncrementalMerger`: lock-protected deduplicating merge

mod csv_store;
mod lock;
mod merge;
mod record;
mod schema;
mod sqlite_store;
mod traits;

pub use csv_store::CsvStore;
pub use lock::DatasetLock;
pub use merge::{compare_values, merge_records, IncrementalMerger, MergeOutcome};
pub use record::{Dataset, Record};
pub use sqlite_store::SqliteStore;
pub use traits::DatasetStore;

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while reading, merging or writing a dataset
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The dataset lock stayed held elsewhere for the whole configured wait
    #[error("Timed out after {waited:?} waiting for dataset lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Dataset {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DatasetError {
    /// Whether the error leaves the dataset unusable for the rest of the run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Result type for dataset operations
pub type DatasetResult<T> = Result<T, DatasetError>;
