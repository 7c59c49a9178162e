//! Command-line tests for the cnpj-etl binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cnpj_etl(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("cnpj-etl").unwrap();
    cmd.env_remove("CNPJ_BASE_URL")
        .env_remove("CNPJ_MAX_CONCURRENT_DOWNLOADS")
        .env("LOG_LEVEL", "warn")
        .arg("--data-dir")
        .arg(dir.path().join(".data"));
    cmd
}

#[test]
fn test_status_json_on_empty_data_dir() {
    let dir = TempDir::new().unwrap();

    cnpj_etl(&dir)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"expected\": 31"))
        .stdout(predicate::str::contains("\"extracted_files\": 0"));

    assert!(!dir.path().join(".data").exists());
}

#[test]
fn test_status_text() {
    let dir = TempDir::new().unwrap();

    cnpj_etl(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Archives:        0/31 present"))
        .stdout(predicate::str::contains("[ ] regime_tributacao"));
}

#[test]
fn test_empty_stage_range_is_rejected() {
    let dir = TempDir::new().unwrap();

    cnpj_etl(&dir)
        .args(["run", "--from", "refine", "--to", "download"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Stage range is empty"));
}

#[test]
fn test_zero_concurrency_is_rejected() {
    let dir = TempDir::new().unwrap();

    cnpj_etl(&dir)
        .args(["download", "--concurrency", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("concurrency must be at least 1"));
}

#[test]
fn test_refine_without_load_fails() {
    let dir = TempDir::new().unwrap();

    cnpj_etl(&dir)
        .args(["--quiet", "refine"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Stage input not found"));
}
