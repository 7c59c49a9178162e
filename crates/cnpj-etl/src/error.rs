//! Error types for the ETL stages

use crate::transport::TransportError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Error type for every pipeline stage
///
/// A failed stage never leaves a half-written artifact or table behind, so
/// re-running the stage is the recovery path for all of these.
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to download '{name}': {source}")]
    Download {
        name: String,
        #[source]
        source: TransportError,
    },

    #[error("{failed} of {total} downloads failed; first failure: {first}")]
    Batch {
        failed: usize,
        total: usize,
        first: Box<EtlError>,
    },

    #[error("Invalid source format in {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("No input files for dataset '{dataset}' (pattern '{pattern}')")]
    NoInputFiles { dataset: String, pattern: String },

    #[error("Stage input not found: {path}")]
    MissingInput { path: PathBuf },

    #[error("Artifact store error: {0}")]
    Artifact(#[from] cnpj_common::CommonError),

    #[error("Analytical store error: {0}")]
    Store(#[from] duckdb::Error),

    #[error("Archive error in {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Admission gate closed")]
    GateClosed(#[from] tokio::sync::AcquireError),

    #[error("Stage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EtlError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a source format error
    pub fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
