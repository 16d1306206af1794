//! Configuration module for Tidemark
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use tidemark::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("ingest.toml")).unwrap();
//! println!("Workers: {}", config.workers.worker_count);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    CheckpointConfig, Config, CorruptionPolicy, DatasetConfig, DatasetFormat, ExtractConfig,
    FetchConfig, FieldRule, IdentityConfig, LogRotation, LoggingConfig, MetricsConfig,
    RetryConfig, UnitsConfig, WorkerConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
