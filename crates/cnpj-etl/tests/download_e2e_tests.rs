//! End-to-end tests for the download stage against a mock HTTP server
//!
//! Covers:
//! - Skipping archives that are already present
//! - Percent-encoded remote paths
//! - HTTP failures leaving nothing published

use cnpj_common::artifact::ArtifactStore;
use cnpj_etl::config::{DownloadConfig, FailurePolicy};
use cnpj_etl::download::DownloadManager;
use cnpj_etl::error::EtlError;
use cnpj_etl::manifest::ManifestEntry;
use cnpj_etl::transport::HttpTransport;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

fn manager(server: &MockServer, dir: &TempDir, config: DownloadConfig) -> DownloadManager {
    let store = ArtifactStore::open(dir.path().join("L0-zip")).expect("open store");
    let base = Url::parse(&format!("{}/CNPJ/", server.uri())).expect("base url");
    let transport = HttpTransport::new(Some(Duration::from_secs(10))).expect("http client");
    DownloadManager::new(store, base, Arc::new(transport), &config)
}

#[tokio::test]
async fn test_existing_archive_is_not_requested() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/CNPJ/Cnaes.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"cnae archive".to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/CNPJ/Paises.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"new copy".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(&server, &dir, DownloadConfig::default());
    std::fs::write(manager.store().target("Paises.zip").unwrap(), b"local copy").unwrap();

    let manifest = vec![
        ManifestEntry::from_remote("Cnaes.zip"),
        ManifestEntry::from_remote("Paises.zip"),
    ];
    let report = manager.run(&manifest).await.unwrap();

    assert_eq!(report.considered, 2);
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(
        std::fs::read(manager.store().target("Cnaes.zip").unwrap()).unwrap(),
        b"cnae archive"
    );
    assert_eq!(
        std::fs::read(manager.store().target("Paises.zip").unwrap()).unwrap(),
        b"local copy"
    );
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_remote_path_with_spaces() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/CNPJ/regime_tributario/Lucro%20Real.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"lucro real".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(&server, &dir, DownloadConfig::default());

    let report = manager
        .run(&[ManifestEntry::from_remote("regime_tributario/Lucro Real.zip")])
        .await
        .unwrap();

    assert_eq!(report.downloaded, 1);
    assert!(manager.store().contains("Lucro Real.zip"));
}

#[tokio::test]
async fn test_http_error_publishes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/CNPJ/Simples.zip"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(&server, &dir, DownloadConfig::default());

    let err = manager
        .run(&[ManifestEntry::from_remote("Simples.zip")])
        .await
        .unwrap_err();

    assert!(matches!(err, EtlError::Download { ref name, .. } if name == "Simples.zip"));
    assert!(!manager.store().contains("Simples.zip"));
    let leftovers = std::fs::read_dir(manager.store().root()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_continue_policy_downloads_the_rest() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/CNPJ/Motivos.zip"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/CNPJ/Naturezas.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"naturezas".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = DownloadConfig {
        failure_policy: FailurePolicy::Continue,
        ..Default::default()
    };
    let manager = manager(&server, &dir, config);

    let err = manager
        .run(&[
            ManifestEntry::from_remote("Motivos.zip"),
            ManifestEntry::from_remote("Naturezas.zip"),
        ])
        .await
        .unwrap_err();

    assert!(matches!(err, EtlError::Batch { failed: 1, total: 2, .. }));
    assert!(manager.store().contains("Naturezas.zip"));
}

#[tokio::test]
async fn test_retry_after_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/CNPJ/Municipios.zip"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/CNPJ/Municipios.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"municipios".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = DownloadConfig {
        max_retries: 1,
        retry_delay_secs: 0,
        ..Default::default()
    };
    let manager = manager(&server, &dir, config);

    let report = manager
        .run(&[ManifestEntry::from_remote("Municipios.zip")])
        .await
        .unwrap();

    assert_eq!(report.downloaded, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
