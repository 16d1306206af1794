//! Tidemark: a resilient ingestion engine
//!
//! This crate pulls paginated, rate-limited remote data into a durable local
//! dataset. It survives blocking, partial failures and interrupted runs:
//! requests go through a token bucket, retry with backoff and rotate egress
//! identities, completed work is recorded in a crash-safe checkpoint, and new
//! records are merged into the dataset under an exclusive lock so that at most
//! one row per key survives.

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod fetch;
pub mod fsutil;
pub mod metrics;
pub mod pipeline;

use thiserror::Error;

/// Main error type for Tidemark operations
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] dataset::DatasetError),

    #[error("Extraction error: {0}")]
    Extract(#[from] pipeline::ExtractError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Task(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid selector in config: {0}")]
    InvalidSelector(String),
}

/// Failure of a single fetch, classified for the retry layer
///
/// `Blocked` and `Transient` are retried, `Fatal` never is.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Blocked at {url}: {reason}")]
    Blocked {
        url: String,
        reason: fetch::BlockReason,
    },

    #[error("Transient failure for {url}: {message}")]
    Transient { url: String, message: String },

    #[error("Fatal failure for {url}: {message}")]
    Fatal { url: String, message: String },
}

impl FetchError {
    /// Short label used for error counters
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Blocked { .. } => "blocked",
            Self::Transient { .. } => "transient",
            Self::Fatal { .. } => "fatal",
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

impl fetch::Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal { .. })
    }
}

/// Result type alias for Tidemark operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use checkpoint::{CheckpointStore, Cursor, ProgressTracker};
pub use config::Config;
pub use dataset::{IncrementalMerger, Record};
pub use fetch::{
    BlockDetector, FetchResult, FetchStatus, ProxyIdentity, ProxyRotator, RateLimiter,
    ResilientFetcher, RetryPolicy,
};
pub use metrics::MetricsRegistry;
pub use pipeline::{Pipeline, RunReport, WorkUnit};
