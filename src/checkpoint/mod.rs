//! Checkpoint and resume
//!
//! - `CheckpointStore`: the durable cursor file
//! - `ProgressTracker`: turns out-of-order completions into a contiguous cursor

mod progress;
mod store;

pub use progress::ProgressTracker;
pub use store::{Checkpoint, CheckpointStore, Cursor};

use std::path::PathBuf;
use thiserror::Error;

/// Checkpoint-specific errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint file {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("Checkpoint cannot move backwards from {current} to {requested}")]
    Regression { current: u64, requested: u64 },

    #[error("Failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
}
