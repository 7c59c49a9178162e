//! Archive manifest
//!
//! The fixed list of remote archives the registry publishes, each paired
//! with the local file name it is stored under in the download directory.

use crate::error::{EtlError, Result};
use cnpj_common::artifact::ArtifactStore;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Remote archives of the March 2024 release, relative to the base URL
///
/// Partner ("Socios") archives are not part of the pipeline.
pub const DEFAULT_REMOTE_PATHS: &[&str] = &[
    "Cnaes.zip",
    "Empresas0.zip",
    "Empresas1.zip",
    "Empresas2.zip",
    "Empresas3.zip",
    "Empresas4.zip",
    "Empresas5.zip",
    "Empresas6.zip",
    "Empresas7.zip",
    "Empresas8.zip",
    "Empresas9.zip",
    "Estabelecimentos0.zip",
    "Estabelecimentos1.zip",
    "Estabelecimentos2.zip",
    "Estabelecimentos3.zip",
    "Estabelecimentos4.zip",
    "Estabelecimentos5.zip",
    "Estabelecimentos6.zip",
    "Estabelecimentos7.zip",
    "Estabelecimentos8.zip",
    "Estabelecimentos9.zip",
    "Motivos.zip",
    "Municipios.zip",
    "Naturezas.zip",
    "Paises.zip",
    "Qualificacoes.zip",
    "Simples.zip",
    "regime_tributario/Imunes e isentas.zip",
    "regime_tributario/Lucro Arbitrado.zip",
    "regime_tributario/Lucro Presumido 1.zip",
    "regime_tributario/Lucro Real.zip",
];

/// One remote archive and the name it is stored under locally
///
/// Identity is the local name; two entries with the same local name would
/// race for the same published path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the base URL
    pub remote_path: String,
    /// File name in the download directory
    pub local_name: String,
}

impl ManifestEntry {
    pub fn new(remote_path: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
            local_name: local_name.into(),
        }
    }

    /// Entry whose local name is the last segment of the remote path
    pub fn from_remote(remote_path: impl Into<String>) -> Self {
        let remote_path = remote_path.into();
        let local_name = remote_path
            .rsplit('/')
            .next()
            .unwrap_or(&remote_path)
            .to_string();
        Self {
            remote_path,
            local_name,
        }
    }

    /// Absolute URL of the archive
    pub fn url(&self, base: &Url) -> Result<Url> {
        base.join(&self.remote_path).map_err(|e| {
            EtlError::config(format!("Invalid remote path '{}': {}", self.remote_path, e))
        })
    }
}

/// The registry's full manifest
pub fn default_manifest() -> Vec<ManifestEntry> {
    DEFAULT_REMOTE_PATHS
        .iter()
        .map(|path| ManifestEntry::from_remote(*path))
        .collect()
}

/// Check that every entry is usable and local names are unique
pub fn validate(entries: &[ManifestEntry]) -> Result<()> {
    let mut seen = HashSet::new();
    for entry in entries {
        if entry.remote_path.trim().is_empty() {
            return Err(EtlError::config(format!(
                "Manifest entry '{}' has an empty remote path",
                entry.local_name
            )));
        }
        ArtifactStore::check_name(&entry.local_name).map_err(|_| {
            EtlError::config(format!(
                "Manifest entry '{}' has an invalid local name '{}'",
                entry.remote_path, entry.local_name
            ))
        })?;
        if !seen.insert(entry.local_name.as_str()) {
            return Err(EtlError::config(format!(
                "Duplicate local name in manifest: '{}'",
                entry.local_name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest_is_valid() {
        let manifest = default_manifest();
        assert_eq!(manifest.len(), 31);
        validate(&manifest).unwrap();
    }

    #[test]
    fn test_local_name_is_last_segment() {
        let entry = ManifestEntry::from_remote("regime_tributario/Lucro Real.zip");
        assert_eq!(entry.local_name, "Lucro Real.zip");
        assert_eq!(entry.remote_path, "regime_tributario/Lucro Real.zip");

        let entry = ManifestEntry::from_remote("Cnaes.zip");
        assert_eq!(entry.local_name, "Cnaes.zip");
    }

    #[test]
    fn test_url_joins_and_encodes() {
        let base = Url::parse("https://dados.rfb.gov.br/CNPJ/").unwrap();
        let entry = ManifestEntry::from_remote("regime_tributario/Lucro Real.zip");
        assert_eq!(
            entry.url(&base).unwrap().as_str(),
            "https://dados.rfb.gov.br/CNPJ/regime_tributario/Lucro%20Real.zip"
        );
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let entries = vec![
            ManifestEntry::from_remote("a/Cnaes.zip"),
            ManifestEntry::from_remote("b/Cnaes.zip"),
        ];
        assert!(matches!(validate(&entries), Err(EtlError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_names() {
        assert!(validate(&[ManifestEntry::new("", "Cnaes.zip")]).is_err());
        assert!(validate(&[ManifestEntry::new("Cnaes.zip", "")]).is_err());
        assert!(validate(&[ManifestEntry::from_remote("dir/")]).is_err());
    }
}
