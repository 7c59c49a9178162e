//! Pipeline configuration
//!
//! Stage directory layout, remote location, and download behavior. Values
//! come from defaults, then `CNPJ_*` environment variables, then CLI flags.

use crate::error::{EtlError, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Layout Constants
// ============================================================================

/// Registry's public download root
pub const DEFAULT_BASE_URL: &str = "https://dados.rfb.gov.br/CNPJ/";

/// Root of all stage directories
pub const DEFAULT_DATA_DIR: &str = ".data";

/// Stage 1 output: downloaded archives
pub const DOWNLOAD_DIR: &str = "L0-zip";

/// Stage 2 output: decoded record files
pub const EXTRACT_DIR: &str = "L1-csv";

/// Stage 3 output: typed store
pub const LOAD_DIR: &str = "L2-silver";

/// Stage 4 output: refined store
pub const REFINE_DIR: &str = "L3-gold";

/// File name of the analytical store in both store stages
pub const STORE_FILE: &str = "rfb-cnpj.duckdb";

/// What the download manager does when one transfer fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The first failure cancels the remaining transfers
    #[default]
    FailFast,
    /// Every transfer runs to completion; failures are reported together
    Continue,
}

impl std::str::FromStr for FailurePolicy {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fail_fast" => Ok(FailurePolicy::FailFast),
            "continue" => Ok(FailurePolicy::Continue),
            _ => Err(EtlError::config(format!(
                "Invalid failure policy '{}'. Must be 'fail_fast' or 'continue'",
                s
            ))),
        }
    }
}

/// Download manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum simultaneous transfers (K)
    pub max_concurrent: usize,

    /// Behavior after a failed transfer
    pub failure_policy: FailurePolicy,

    /// Extra attempts per transfer after the first one fails
    pub max_retries: u32,

    /// Base delay between attempts; attempt N waits N times this
    pub retry_delay_secs: u64,

    /// Whole-request timeout in seconds (0 disables it)
    pub http_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            failure_policy: FailurePolicy::FailFast,
            max_retries: 0,
            retry_delay_secs: 5,
            http_timeout_secs: 3600,
        }
    }
}

impl DownloadConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.retry_delay_secs * u64::from(attempt))
    }

    /// Request timeout, if enabled
    pub fn http_timeout(&self) -> Option<Duration> {
        (self.http_timeout_secs > 0).then(|| Duration::from_secs(self.http_timeout_secs))
    }
}

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root directory holding one subdirectory per stage
    pub data_dir: PathBuf,

    /// URL the manifest's remote paths are relative to
    pub base_url: String,

    /// Stage 1 settings
    pub download: DownloadConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            base_url: DEFAULT_BASE_URL.to_string(),
            download: DownloadConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `CNPJ_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("CNPJ_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(url) = std::env::var("CNPJ_BASE_URL") {
            config.base_url = url;
        }

        if let Ok(value) = std::env::var("CNPJ_MAX_CONCURRENT_DOWNLOADS") {
            config.download.max_concurrent = parse_env("CNPJ_MAX_CONCURRENT_DOWNLOADS", &value)?;
        }

        if let Ok(value) = std::env::var("CNPJ_FAILURE_POLICY") {
            config.download.failure_policy = value.parse()?;
        }

        if let Ok(value) = std::env::var("CNPJ_MAX_RETRIES") {
            config.download.max_retries = parse_env("CNPJ_MAX_RETRIES", &value)?;
        }

        if let Ok(value) = std::env::var("CNPJ_RETRY_DELAY_SECS") {
            config.download.retry_delay_secs = parse_env("CNPJ_RETRY_DELAY_SECS", &value)?;
        }

        if let Ok(value) = std::env::var("CNPJ_HTTP_TIMEOUT_SECS") {
            config.download.http_timeout_secs = parse_env("CNPJ_HTTP_TIMEOUT_SECS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent == 0 {
            return Err(EtlError::config("Download concurrency must be at least 1"));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(EtlError::config("Data directory cannot be empty"));
        }
        self.base_url()?;
        Ok(())
    }

    /// Parsed base URL, always ending in `/` so relative paths append to it
    pub fn base_url(&self) -> Result<Url> {
        let mut raw = self.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let url = Url::parse(&raw)
            .map_err(|e| EtlError::config(format!("Invalid base URL '{}': {}", self.base_url, e)))?;
        if url.cannot_be_a_base() {
            return Err(EtlError::config(format!("Base URL '{}' cannot be a base", self.base_url)));
        }
        Ok(url)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.data_dir.join(DOWNLOAD_DIR)
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.data_dir.join(EXTRACT_DIR)
    }

    pub fn load_dir(&self) -> PathBuf {
        self.data_dir.join(LOAD_DIR)
    }

    pub fn refine_dir(&self) -> PathBuf {
        self.data_dir.join(REFINE_DIR)
    }

    /// Typed store written by stage 3
    pub fn load_store(&self) -> PathBuf {
        store_path(&self.load_dir())
    }

    /// Refined store written by stage 4
    pub fn refine_store(&self) -> PathBuf {
        store_path(&self.refine_dir())
    }
}

fn store_path(dir: &Path) -> PathBuf {
    dir.join(STORE_FILE)
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EtlError::config(format!("Invalid value for {}: '{}'", name, value)))
}
