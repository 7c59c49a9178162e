//! Error types shared across the ETL workspace

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Main error type for shared utilities
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Invalid artifact name: '{0}'")]
    InvalidName(String),

    #[error("Failed to publish {partial} as {target}: {source}")]
    Publish {
        partial: PathBuf,
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
