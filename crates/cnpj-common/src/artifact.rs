//! Artifact store for pipeline stage directories
//!
//! Each pipeline stage owns one directory. A file that exists under its final
//! name is complete: writers always produce `<name>.part` first and rename it
//! into place only after the last byte is flushed. There is no separate
//! ledger of finished work.

use crate::error::{CommonError, Result};
use glob::Pattern;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffix of files that are still being written
pub const PARTIAL_SUFFIX: &str = ".part";

/// A stage directory where existence of a target path means "done"
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open a stage directory, creating it if absent
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory backing this store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject names that would escape the directory or collide with partials
    pub fn check_name(name: &str) -> Result<()> {
        let single_component = Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name);
        if name.is_empty() || !single_component || name.ends_with(PARTIAL_SUFFIX) {
            return Err(CommonError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    /// Final path for an artifact
    pub fn target(&self, name: &str) -> Result<PathBuf> {
        Self::check_name(name)?;
        Ok(self.root.join(name))
    }

    /// Temporary path an artifact is written to before publishing
    pub fn partial_path(&self, name: &str) -> Result<PathBuf> {
        Self::check_name(name)?;
        Ok(self.root.join(format!("{name}{PARTIAL_SUFFIX}")))
    }

    /// Whether the artifact has been published
    pub fn contains(&self, name: &str) -> bool {
        Self::check_name(name).is_ok() && self.root.join(name).is_file()
    }

    /// Size in bytes of a published artifact
    pub fn size(&self, name: &str) -> Result<u64> {
        Ok(fs::metadata(self.target(name)?)?.len())
    }

    /// Atomically move a fully written partial file to its final name
    pub fn publish(&self, partial: &Path, name: &str) -> Result<PathBuf> {
        let target = self.target(name)?;
        fs::rename(partial, &target).map_err(|source| CommonError::Publish {
            partial: partial.to_path_buf(),
            target: target.clone(),
            source,
        })?;
        debug!(artifact = %name, "Published artifact");
        Ok(target)
    }

    /// Remove leftovers of interrupted writes
    ///
    /// Returns the number of partial files removed.
    pub fn sweep_partials(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let is_partial = name.to_string_lossy().ends_with(PARTIAL_SUFFIX);
            if is_partial && entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                debug!(file = %name.to_string_lossy(), "Removed stale partial file");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Published artifacts whose file name matches a glob pattern, sorted by name
    pub fn list(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let matcher = Pattern::new(pattern).map_err(|source| CommonError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;

        let mut matches = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(PARTIAL_SUFFIX) && matcher.matches(&name) {
                matches.push(entry.path());
            }
        }
        matches.sort();
        Ok(matches)
    }
}
