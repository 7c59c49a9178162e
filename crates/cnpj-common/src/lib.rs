//! CNPJ Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the CNPJ registry ETL workspace.
//!
//! # Overview
//!
//! - **Artifact Store**: stage directories where the presence of a file is
//!   the only completion signal, with write-then-rename publishing
//! - **Logging**: tracing subscriber setup shared by every binary
//! - **Error Handling**: common error and result types
//!
//! # Example
//!
//! ```no_run
//! use cnpj_common::artifact::ArtifactStore;
//!
//! fn main() -> cnpj_common::Result<()> {
//!     let store = ArtifactStore::open(".data/L0-zip")?;
//!     if store.contains("Cnaes.zip") {
//!         println!("already downloaded");
//!     }
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
