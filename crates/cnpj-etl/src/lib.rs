//! CNPJ Registry ETL Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Turns the Receita Federal's public CNPJ release into a typed, refined
//! DuckDB database in four re-runnable stages:
//!
//! 1. **Download**: fetch the archive manifest into `L0-zip`, at most K at a time
//! 2. **Extract**: unpack every archive member into `L1-csv`, re-encoded to UTF-8
//! 3. **Load**: create one typed table per dataset in `L2-silver`
//! 4. **Refine**: join, clean, and copy tables into `L3-gold`
//!
//! Each stage skips any unit of work whose output already exists, so a failed
//! run is resumed by running it again.
//!
//! # Example
//!
//! ```no_run
//! use cnpj_etl::config::PipelineConfig;
//! use cnpj_etl::pipeline::{Pipeline, StageRange};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = Pipeline::new(PipelineConfig::from_env()?)?;
//!     let report = pipeline.run(StageRange::all()).await?;
//!     println!("{:?}", report.load);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod download;
pub mod error;
pub mod extract;
pub mod load;
pub mod manifest;
pub mod pipeline;
pub mod progress;
pub mod refine;
pub mod schema;
pub mod store;
pub mod transport;

pub use error::{EtlError, Result};
