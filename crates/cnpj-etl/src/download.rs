//! Stage 1: download manager
//!
//! Ensures every manifest entry exists in the download directory. Missing
//! archives are streamed to `<name>.part` and renamed into place once the
//! last byte is synced, so a published archive is always complete. At most
//! `max_concurrent` transfers are in flight at any instant.

use crate::config::{DownloadConfig, FailurePolicy};
use crate::error::{EtlError, Result};
use crate::manifest::{self, ManifestEntry};
use crate::progress::{ProgressReporter, SilentReporter};
use crate::transport::{Transport, TransportError};
use cnpj_common::artifact::ArtifactStore;
use futures::future::{join_all, try_join_all};
use futures::StreamExt;
use reqwest::Url;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

// ============================================================================
// Admission Gate
// ============================================================================

/// Counting gate bounding simultaneous transfers
///
/// Besides the semaphore it tracks how many holders are inside and the
/// highest count ever observed.
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Semaphore,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Wait for a free slot
    pub async fn admit(&self) -> Result<Admission<'_>> {
        let permit = self.semaphore.acquire().await?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Admission {
            _permit: permit,
            gate: self,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Holders currently inside the gate
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous holders seen so far
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A held slot; dropping it frees the slot whatever the transfer outcome
#[derive(Debug)]
pub struct Admission<'a> {
    _permit: SemaphorePermit<'a>,
    gate: &'a AdmissionGate,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Download Manager
// ============================================================================

/// Outcome of a download run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    /// Manifest entries considered
    pub considered: usize,
    /// Entries transferred during this run
    pub downloaded: usize,
    /// Entries already present
    pub skipped: usize,
    /// Bytes transferred during this run
    pub bytes: u64,
}

enum Outcome {
    Downloaded(u64),
    Skipped,
}

/// Bounded-concurrency downloader into an artifact store
pub struct DownloadManager {
    store: ArtifactStore,
    base_url: Url,
    transport: Arc<dyn Transport>,
    progress: Arc<dyn ProgressReporter>,
    gate: AdmissionGate,
    policy: FailurePolicy,
    max_retries: u32,
    retry_delay: Duration,
}

impl DownloadManager {
    pub fn new(
        store: ArtifactStore,
        base_url: Url,
        transport: Arc<dyn Transport>,
        config: &DownloadConfig,
    ) -> Self {
        Self {
            store,
            base_url,
            transport,
            progress: Arc::new(SilentReporter),
            gate: AdmissionGate::new(config.max_concurrent.max(1)),
            policy: config.failure_policy,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(1),
        }
    }

    /// Report transfer progress through `progress`
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Ensure every entry of `entries` is present locally
    pub async fn run(&self, entries: &[ManifestEntry]) -> Result<DownloadReport> {
        manifest::validate(entries)?;

        let swept = self.store.sweep_partials()?;
        if swept > 0 {
            info!(count = swept, "Removed partial downloads from an earlier run");
        }

        info!(
            entries = entries.len(),
            max_concurrent = self.gate.capacity(),
            policy = ?self.policy,
            "Starting downloads"
        );

        let tasks = entries.iter().map(|entry| self.ensure(entry));
        let outcomes = match self.policy {
            FailurePolicy::FailFast => try_join_all(tasks).await?,
            FailurePolicy::Continue => {
                let results = join_all(tasks).await;
                let total = results.len();
                let mut outcomes = Vec::with_capacity(total);
                let mut errors = Vec::new();
                for result in results {
                    match result {
                        Ok(outcome) => outcomes.push(outcome),
                        Err(e) => errors.push(e),
                    }
                }
                let failed = errors.len();
                if let Some(first) = errors.into_iter().next() {
                    return Err(EtlError::Batch {
                        failed,
                        total,
                        first: Box::new(first),
                    });
                }
                outcomes
            },
        };

        let mut report = DownloadReport {
            considered: entries.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                Outcome::Downloaded(bytes) => {
                    report.downloaded += 1;
                    report.bytes += bytes;
                },
                Outcome::Skipped => report.skipped += 1,
            }
        }
        info!(
            considered = report.considered,
            downloaded = report.downloaded,
            skipped = report.skipped,
            bytes = report.bytes,
            peak_in_flight = self.gate.peak(),
            "Downloads complete"
        );
        Ok(report)
    }

    async fn ensure(&self, entry: &ManifestEntry) -> Result<Outcome> {
        let name = entry.local_name.as_str();

        if self.store.contains(name) {
            let size = self.store.size(name)?;
            let mut task = self.progress.begin(name, Some(size));
            task.advance(size);
            task.finish();
            debug!(file = %name, size, "Already downloaded, skipping");
            return Ok(Outcome::Skipped);
        }

        let url = entry.url(&self.base_url)?;
        let _admission = self.gate.admit().await?;

        let mut attempt = 0;
        loop {
            match self.transfer(name, &url).await {
                Ok(bytes) => {
                    info!(file = %name, bytes, "Downloaded");
                    return Ok(Outcome::Downloaded(bytes));
                },
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.retry_delay * attempt;
                    warn!(
                        file = %name,
                        error = %e,
                        attempt,
                        max_retries = self.max_retries,
                        "Download failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt: stream into the partial file, then publish it
    async fn transfer(&self, name: &str, url: &Url) -> Result<u64> {
        let partial = self.store.partial_path(name)?;

        match self.write_partial(name, url, &partial).await {
            Ok(bytes) => {
                self.store.publish(&partial, name)?;
                Ok(bytes)
            },
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %remove_err, "Could not remove partial file");
                    }
                }
                Err(e)
            },
        }
    }

    async fn write_partial(&self, name: &str, url: &Url, partial: &Path) -> Result<u64> {
        let fail = |source: TransportError| EtlError::Download {
            name: name.to_string(),
            source,
        };

        debug!(file = %name, url = %url, "Requesting");
        let body = self.transport.get(url).await.map_err(fail)?;
        let mut task = self.progress.begin(name, body.content_length);

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| fail(e.into()))?;
        let mut chunks = body.chunks;
        let mut written = 0u64;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(fail)?;
            file.write_all(&chunk).await.map_err(|e| fail(e.into()))?;
            written += chunk.len() as u64;
            task.advance(chunk.len() as u64);
        }

        file.flush().await.map_err(|e| fail(e.into()))?;
        file.sync_all().await.map_err(|e| fail(e.into()))?;
        task.finish();

        Ok(written)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::progress::ProgressTask;
    use crate::transport::RemoteBody;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone)]
    enum FakeBody {
        Ok(Vec<u8>),
        /// Sends the bytes, then breaks the stream
        BreakAfter(Vec<u8>),
        Status(u16),
    }

    #[derive(Default)]
    struct FakeTransport {
        bodies: Mutex<HashMap<String, FakeBody>>,
        /// Bodies served once before falling back to `bodies`
        first_attempt: Mutex<HashMap<String, FakeBody>>,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
    }

    impl FakeTransport {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn serve(&self, name: &str, body: FakeBody) {
            self.bodies.lock().unwrap().insert(name.to_string(), body);
        }

        fn serve_first(&self, name: &str, body: FakeBody) {
            self.first_attempt.lock().unwrap().insert(name.to_string(), body);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn get(&self, url: &Url) -> std::result::Result<RemoteBody, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let name = url.path().trim_start_matches('/').to_string();
            let first = self.first_attempt.lock().unwrap().remove(&name);
            let body = first
                .or_else(|| self.bodies.lock().unwrap().get(&name).cloned())
                .unwrap_or(FakeBody::Status(404));

            let chunks: Vec<std::result::Result<Vec<u8>, TransportError>> = match body {
                FakeBody::Ok(bytes) => vec![Ok(bytes)],
                FakeBody::BreakAfter(bytes) => {
                    vec![Ok(bytes), Err(TransportError::Body("connection reset".into()))]
                },
                FakeBody::Status(status) => {
                    return Err(TransportError::Status {
                        url: url.to_string(),
                        status,
                    })
                },
            };
            let content_length = Some(chunks.iter().flatten().map(|c| c.len() as u64).sum());
            Ok(RemoteBody {
                content_length,
                chunks: futures::stream::iter(chunks).boxed(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        events: Arc<Mutex<Vec<(String, Option<u64>)>>>,
        advanced: Arc<AtomicUsize>,
    }

    struct RecordingTask(Arc<AtomicUsize>);

    impl ProgressTask for RecordingTask {
        fn advance(&mut self, n: u64) {
            self.0.fetch_add(n as usize, Ordering::SeqCst);
        }
        fn finish(&mut self) {}
    }

    impl ProgressReporter for RecordingReporter {
        fn begin(&self, label: &str, total: Option<u64>) -> Box<dyn ProgressTask> {
            self.events.lock().unwrap().push((label.to_string(), total));
            Box::new(RecordingTask(self.advanced.clone()))
        }
    }

    fn manager(dir: &TempDir, transport: Arc<FakeTransport>, config: DownloadConfig) -> DownloadManager {
        let store = ArtifactStore::open(dir.path().join("L0-zip")).unwrap();
        let base = Url::parse("http://fake.test/").unwrap();
        DownloadManager::new(store, base, transport, &config)
    }

    fn entries(names: &[&str]) -> Vec<ManifestEntry> {
        names.iter().map(|n| ManifestEntry::from_remote(*n)).collect()
    }

    #[tokio::test]
    async fn test_admission_gate_tracks_peak() {
        let gate = AdmissionGate::new(2);
        let a = gate.admit().await.unwrap();
        let b = gate.admit().await.unwrap();
        assert_eq!(gate.in_flight(), 2);
        drop(a);
        assert_eq!(gate.in_flight(), 1);
        let c = gate.admit().await.unwrap();
        drop(b);
        drop(c);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.peak(), 2);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::with_delay(Duration::from_millis(50)));
        let names = ["A.zip", "B.zip", "C.zip", "D.zip", "E.zip"];
        for name in names {
            transport.serve(name, FakeBody::Ok(name.as_bytes().to_vec()));
        }
        let config = DownloadConfig {
            max_concurrent: 2,
            ..Default::default()
        };
        let manager = manager(&dir, transport.clone(), config);

        let report = manager.run(&entries(&names)).await.unwrap();

        assert_eq!(report.downloaded, 5);
        assert_eq!(manager.gate().peak(), 2);
        assert!(transport.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(manager.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_second_run_does_no_work() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        transport.serve("Cnaes.zip", FakeBody::Ok(b"cnae".to_vec()));
        transport.serve("Paises.zip", FakeBody::Ok(b"pais".to_vec()));
        let manager = manager(&dir, transport.clone(), DownloadConfig::default());
        let manifest = entries(&["Cnaes.zip", "Paises.zip"]);

        let first = manager.run(&manifest).await.unwrap();
        assert_eq!(first.downloaded, 2);
        assert_eq!(first.bytes, 8);
        assert_eq!(transport.calls(), 2);

        let second = manager.run(&manifest).await.unwrap();
        assert_eq!(
            second,
            DownloadReport {
                considered: 2,
                downloaded: 0,
                skipped: 2,
                bytes: 0
            }
        );
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_broken_stream_publishes_nothing() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        transport.serve("Simples.zip", FakeBody::BreakAfter(b"half".to_vec()));
        let manager = manager(&dir, transport.clone(), DownloadConfig::default());
        let manifest = entries(&["Simples.zip"]);

        let err = manager.run(&manifest).await.unwrap_err();
        assert!(matches!(err, EtlError::Download { ref name, .. } if name == "Simples.zip"));
        assert!(!manager.store().contains("Simples.zip"));
        assert!(!manager.store().partial_path("Simples.zip").unwrap().exists());

        transport.serve("Simples.zip", FakeBody::Ok(b"whole archive".to_vec()));
        let report = manager.run(&manifest).await.unwrap();
        assert_eq!(report.downloaded, 1);
        let target = manager.store().target("Simples.zip").unwrap();
        assert_eq!(std::fs::read(target).unwrap(), b"whole archive");
    }

    #[tokio::test]
    async fn test_continue_policy_reports_batch() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        transport.serve("Cnaes.zip", FakeBody::Ok(b"cnae".to_vec()));
        transport.serve("Motivos.zip", FakeBody::Status(500));
        transport.serve("Paises.zip", FakeBody::Ok(b"pais".to_vec()));
        let config = DownloadConfig {
            failure_policy: FailurePolicy::Continue,
            ..Default::default()
        };
        let manager = manager(&dir, transport, config);

        let err = manager
            .run(&entries(&["Cnaes.zip", "Motivos.zip", "Paises.zip"]))
            .await
            .unwrap_err();

        match err {
            EtlError::Batch { failed, total, first } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
                assert!(matches!(*first, EtlError::Download { ref name, .. } if name == "Motivos.zip"));
            },
            other => panic!("unexpected error: {other}"),
        }
        assert!(manager.store().contains("Cnaes.zip"));
        assert!(manager.store().contains("Paises.zip"));
        assert!(!manager.store().contains("Motivos.zip"));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_broken_stream() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        transport.serve_first("Naturezas.zip", FakeBody::BreakAfter(b"par".to_vec()));
        transport.serve("Naturezas.zip", FakeBody::Ok(b"complete".to_vec()));
        let config = DownloadConfig {
            max_retries: 2,
            retry_delay_secs: 0,
            ..Default::default()
        };
        let manager = manager(&dir, transport.clone(), config);

        let report = manager.run(&entries(&["Naturezas.zip"])).await.unwrap();

        assert_eq!(report.downloaded, 1);
        assert_eq!(transport.calls(), 2);
        let target = manager.store().target("Naturezas.zip").unwrap();
        assert_eq!(std::fs::read(target).unwrap(), b"complete");
    }

    #[tokio::test]
    async fn test_stale_partials_are_swept() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        transport.serve("Cnaes.zip", FakeBody::Ok(b"cnae".to_vec()));
        let manager = manager(&dir, transport, DownloadConfig::default());
        let stale = manager.store().partial_path("Empresas0.zip").unwrap();
        std::fs::write(&stale, b"interrupted").unwrap();

        manager.run(&entries(&["Cnaes.zip"])).await.unwrap();

        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_skipped_entry_reports_full_progress() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let reporter = RecordingReporter::default();
        let events = reporter.events.clone();
        let advanced = reporter.advanced.clone();
        let manager = manager(&dir, transport.clone(), DownloadConfig::default())
            .with_progress(Arc::new(reporter));
        std::fs::write(manager.store().target("Cnaes.zip").unwrap(), b"12345").unwrap();

        let report = manager.run(&entries(&["Cnaes.zip"])).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(transport.calls(), 0);
        assert_eq!(events.lock().unwrap().as_slice(), &[("Cnaes.zip".to_string(), Some(5))]);
        assert_eq!(advanced.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_invalid_manifest_is_rejected_before_any_transfer() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let manager = manager(&dir, transport.clone(), DownloadConfig::default());

        let result = manager.run(&entries(&["a/Cnaes.zip", "b/Cnaes.zip"])).await;

        assert!(matches!(result, Err(EtlError::Config(_))));
        assert_eq!(transport.calls(), 0);
    }
}
