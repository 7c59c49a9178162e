//! Stage orchestration
//!
//! Runs a contiguous range of the four stages in order. A stage only starts
//! after the previous one returned successfully; a failure stops the run and
//! leaves earlier stages' outputs in place for the next attempt.

use crate::config::PipelineConfig;
use crate::download::{DownloadManager, DownloadReport};
use crate::error::{EtlError, Result};
use crate::extract::{ExtractReport, Extractor};
use crate::load::{LoadReport, Loader};
use crate::manifest::{self, ManifestEntry};
use crate::progress::{ProgressReporter, SilentReporter};
use crate::refine::{self, RefineReport, Refiner};
use crate::schema;
use crate::store::AnalyticalStore;
use crate::transport::{HttpTransport, Transport};
use chrono::{DateTime, Utc};
use cnpj_common::artifact::{ArtifactStore, PARTIAL_SUFFIX};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Download,
    Extract,
    Load,
    Refine,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Download, Stage::Extract, Stage::Load, Stage::Refine];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Load => "load",
            Stage::Refine => "refine",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inclusive, non-empty range of stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRange {
    from: Stage,
    to: Stage,
}

impl StageRange {
    pub fn new(from: Stage, to: Stage) -> Result<Self> {
        if from > to {
            return Err(EtlError::config(format!(
                "Stage range is empty: '{}' comes after '{}'",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    pub fn all() -> Self {
        Self {
            from: Stage::Download,
            to: Stage::Refine,
        }
    }

    pub fn single(stage: Stage) -> Self {
        Self {
            from: stage,
            to: stage,
        }
    }

    pub fn from(&self) -> Stage {
        self.from
    }

    pub fn to(&self) -> Stage {
        self.to
    }

    pub fn contains(&self, stage: Stage) -> bool {
        (self.from..=self.to).contains(&stage)
    }

    /// Stages of the range in execution order
    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        Stage::ALL.into_iter().filter(|s| self.contains(*s))
    }
}

impl Default for StageRange {
    fn default() -> Self {
        Self::all()
    }
}

/// Reports of the stages a run executed
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub download: Option<DownloadReport>,
    pub extract: Option<ExtractReport>,
    pub load: Option<LoadReport>,
    pub refine: Option<RefineReport>,
}

impl PipelineReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            download: None,
            extract: None,
            load: None,
            refine: None,
        }
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveStatus {
    pub expected: usize,
    pub present: usize,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStatus {
    pub table: String,
    pub present: bool,
}

/// Completed units of work per stage, by the existence rule
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub data_dir: PathBuf,
    pub archives: ArchiveStatus,
    pub extracted_files: usize,
    pub load_tables: Vec<TableStatus>,
    pub refine_tables: Vec<TableStatus>,
}

impl PipelineStatus {
    /// Whether every unit of every stage is complete
    pub fn is_complete(&self) -> bool {
        self.archives.missing.is_empty()
            && self.extracted_files > 0
            && self.load_tables.iter().all(|t| t.present)
            && self.refine_tables.iter().all(|t| t.present)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// The four-stage ETL over one data directory
pub struct Pipeline {
    config: PipelineConfig,
    manifest: Vec<ManifestEntry>,
    transport: Arc<dyn Transport>,
    progress: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    /// Pipeline over the registry manifest using HTTP downloads
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.download.http_timeout())
            .map_err(|e| EtlError::config(format!("Failed to build HTTP client: {}", e)))?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Pipeline fetching archives through `transport`
    pub fn with_transport(config: PipelineConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            manifest: manifest::default_manifest(),
            transport,
            progress: Arc::new(SilentReporter),
        })
    }

    /// Replace the archive manifest
    pub fn with_manifest(mut self, entries: Vec<ManifestEntry>) -> Result<Self> {
        manifest::validate(&entries)?;
        self.manifest = entries;
        Ok(self)
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn manifest(&self) -> &[ManifestEntry] {
        &self.manifest
    }

    /// Stage 1
    pub async fn download(&self) -> Result<DownloadReport> {
        let store = ArtifactStore::open(self.config.download_dir())?;
        let manager = DownloadManager::new(
            store,
            self.config.base_url()?,
            self.transport.clone(),
            &self.config.download,
        )
        .with_progress(self.progress.clone());

        manager
            .run(&self.manifest)
            .instrument(info_span!("stage", stage = %Stage::Download))
            .await
    }

    /// Stage 2
    pub async fn extract(&self) -> Result<ExtractReport> {
        let input = ArtifactStore::open(self.config.download_dir())?;
        let output = ArtifactStore::open(self.config.extract_dir())?;
        run_blocking(Stage::Extract, move || Extractor::new(input, output).run()).await
    }

    /// Stage 3
    pub async fn load(&self) -> Result<LoadReport> {
        let input = ArtifactStore::open(self.config.extract_dir())?;
        let loader = Loader::new(input, self.config.load_store());
        run_blocking(Stage::Load, move || loader.run()).await
    }

    /// Stage 4
    pub async fn refine(&self) -> Result<RefineReport> {
        let refiner = Refiner::new(self.config.load_store(), self.config.refine_store());
        run_blocking(Stage::Refine, move || refiner.run()).await
    }

    /// Run every stage of `range` in order, stopping at the first failure
    pub async fn run(&self, range: StageRange) -> Result<PipelineReport> {
        info!(
            from = %range.from(),
            to = %range.to(),
            data_dir = %self.config.data_dir.display(),
            "Starting pipeline"
        );

        let mut report = PipelineReport::new();
        for stage in range.stages() {
            let outcome = match stage {
                Stage::Download => self.download().await.map(|r| report.download = Some(r)),
                Stage::Extract => self.extract().await.map(|r| report.extract = Some(r)),
                Stage::Load => self.load().await.map(|r| report.load = Some(r)),
                Stage::Refine => self.refine().await.map(|r| report.refine = Some(r)),
            };
            if let Err(e) = outcome {
                error!(stage = %stage, error = %e, "Stage failed; outputs of earlier stages are kept");
                return Err(e);
            }
        }

        let finished_at = Utc::now();
        report.finished_at = Some(finished_at);
        info!(
            elapsed_secs = (finished_at - report.started_at).num_seconds(),
            "Pipeline complete"
        );
        Ok(report)
    }

    /// Inspect every stage's output without creating or changing anything
    pub fn status(&self) -> Result<PipelineStatus> {
        let download_dir = self.config.download_dir();
        let missing: Vec<String> = self
            .manifest
            .iter()
            .filter(|entry| !download_dir.join(&entry.local_name).is_file())
            .map(|entry| entry.local_name.clone())
            .collect();

        Ok(PipelineStatus {
            data_dir: self.config.data_dir.clone(),
            archives: ArchiveStatus {
                expected: self.manifest.len(),
                present: self.manifest.len() - missing.len(),
                missing,
            },
            extracted_files: count_published(&self.config.extract_dir())?,
            load_tables: table_status(&self.config.load_store(), schema::loaded_tables())?,
            refine_tables: table_status(
                &self.config.refine_store(),
                refine::refined_tables().into_iter().map(|(table, _)| table),
            )?,
        })
    }
}

/// Run blocking stage work off the async runtime
async fn run_blocking<T, F>(stage: Stage, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let span = info_span!("stage", stage = %stage);
    tokio::task::spawn_blocking(move || span.in_scope(work)).await?
}

fn count_published(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let is_partial = entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX);
        if entry.file_type()?.is_file() && !is_partial {
            count += 1;
        }
    }
    Ok(count)
}

fn table_status<'a>(store: &Path, tables: impl Iterator<Item = &'a str>) -> Result<Vec<TableStatus>> {
    let existing = if store.is_file() {
        AnalyticalStore::open_read_only(store)?.tables()?
    } else {
        Vec::new()
    };
    Ok(tables
        .map(|table| TableStatus {
            table: table.to_string(),
            present: existing.iter().any(|t| t == table),
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> PipelineConfig {
        PipelineConfig {
            data_dir: dir.path().join("data"),
            base_url: "http://localhost:1/CNPJ/".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_stage_order() {
        assert!(Stage::Download < Stage::Extract);
        assert!(Stage::Load < Stage::Refine);
        assert_eq!(Stage::Load.to_string(), "load");
    }

    #[test]
    fn test_stage_range() {
        let range = StageRange::new(Stage::Extract, Stage::Load).unwrap();
        assert_eq!(range.stages().collect::<Vec<_>>(), vec![Stage::Extract, Stage::Load]);
        assert!(!range.contains(Stage::Download));

        assert_eq!(StageRange::all().stages().count(), 4);
        assert_eq!(StageRange::single(Stage::Refine).stages().collect::<Vec<_>>(), vec![Stage::Refine]);
        assert!(matches!(
            StageRange::new(Stage::Refine, Stage::Download),
            Err(EtlError::Config(_))
        ));
    }

    #[test]
    fn test_status_does_not_create_directories() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(config(&dir)).unwrap();

        let status = pipeline.status().unwrap();

        assert_eq!(status.archives.expected, 31);
        assert_eq!(status.archives.present, 0);
        assert_eq!(status.extracted_files, 0);
        assert!(status.load_tables.iter().all(|t| !t.present));
        assert_eq!(status.refine_tables.len(), 7);
        assert!(!status.is_complete());
        assert!(!dir.path().join("data").exists());
    }

    #[test]
    fn test_status_counts_published_files() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        std::fs::create_dir_all(config.download_dir()).unwrap();
        std::fs::create_dir_all(config.extract_dir()).unwrap();
        std::fs::write(config.download_dir().join("Cnaes.zip"), b"zip").unwrap();
        std::fs::write(config.extract_dir().join("F.K03200$Z.D40309.CNAECSV"), b"").unwrap();
        std::fs::write(config.extract_dir().join("K3241.K03200Y0.D40309.EMPRECSV.part"), b"").unwrap();
        let pipeline = Pipeline::new(config).unwrap();

        let status = pipeline.status().unwrap();

        assert_eq!(status.archives.present, 1);
        assert!(!status.archives.missing.contains(&"Cnaes.zip".to_string()));
        assert_eq!(status.extracted_files, 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.download.max_concurrent = 0;

        assert!(Pipeline::new(config).is_err());
    }

    #[tokio::test]
    async fn test_refine_before_load_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(config(&dir)).unwrap();

        let err = pipeline.run(StageRange::single(Stage::Refine)).await.unwrap_err();

        assert!(matches!(err, EtlError::MissingInput { .. }));
    }
}
