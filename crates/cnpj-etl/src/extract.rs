//! Stage 2: archive extraction
//!
//! Every member of every downloaded archive becomes one file in the
//! extraction directory, re-encoded from ISO-8859-1 to UTF-8. The content is
//! otherwise untouched: field and line boundaries are preserved byte for byte.

use crate::error::{EtlError, Result};
use cnpj_common::artifact::ArtifactStore;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

const ARCHIVE_PATTERN: &str = "*.zip";
const CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of an extraction run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
    /// Archives opened
    pub archives: usize,
    /// Members considered, including skipped ones
    pub members: usize,
    /// Members written during this run
    pub extracted: usize,
    /// Members whose output already existed
    pub skipped: usize,
}

/// Decode ISO-8859-1 bytes, appending to `out`
///
/// Every byte maps to the code point of the same value, so this cannot fail.
pub fn latin1_to_utf8(input: &[u8], out: &mut String) {
    out.reserve(input.len());
    out.extend(input.iter().map(|&b| char::from(b)));
}

/// Stream `reader` to `writer`, re-encoding ISO-8859-1 as UTF-8
///
/// Returns the number of input bytes consumed.
pub fn transcode<R: Read, W: Write>(mut reader: R, mut writer: W) -> std::io::Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut text = String::with_capacity(CHUNK_SIZE * 2);
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        text.clear();
        latin1_to_utf8(&buf[..n], &mut text);
        writer.write_all(text.as_bytes())?;
        total += n as u64;
    }

    writer.flush()?;
    Ok(total)
}

/// Unpacks archives from one stage directory into the next
#[derive(Debug, Clone)]
pub struct Extractor {
    input: ArtifactStore,
    output: ArtifactStore,
}

impl Extractor {
    pub fn new(input: ArtifactStore, output: ArtifactStore) -> Self {
        Self { input, output }
    }

    /// Extract every member of every archive not yet present in the output
    pub fn run(&self) -> Result<ExtractReport> {
        let swept = self.output.sweep_partials()?;
        if swept > 0 {
            info!(count = swept, "Removed partial extractions from an earlier run");
        }

        let archives = self.input.list(ARCHIVE_PATTERN)?;
        info!(archives = archives.len(), input = %self.input.root().display(), "Starting extraction");

        let mut report = ExtractReport::default();
        for archive in &archives {
            self.extract_archive(archive, &mut report)?;
            report.archives += 1;
        }

        info!(
            archives = report.archives,
            members = report.members,
            extracted = report.extracted,
            skipped = report.skipped,
            "Extraction complete"
        );
        Ok(report)
    }

    fn extract_archive(&self, path: &Path, report: &mut ExtractReport) -> Result<()> {
        let archive_err = |source: zip::result::ZipError| EtlError::Archive {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path)?;
        let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(archive_err)?;
        debug!(archive = %path.display(), members = archive.len(), "Opened archive");

        for index in 0..archive.len() {
            let member = archive.by_index(index).map_err(archive_err)?;
            if member.is_dir() {
                continue;
            }

            let Some(name) = member.enclosed_name().and_then(|p| output_name(&p)) else {
                warn!(archive = %path.display(), member = member.name(), "Skipping member without a safe name");
                continue;
            };

            report.members += 1;
            if self.output.contains(&name) {
                debug!(file = %name, "Already extracted, skipping");
                report.skipped += 1;
                continue;
            }

            let bytes = self.write_member(member, &name)?;
            info!(file = %name, bytes, "Extracted");
            report.extracted += 1;
        }

        Ok(())
    }

    fn write_member<R: Read>(&self, member: R, name: &str) -> Result<u64> {
        let partial = self.output.partial_path(name)?;

        let written = File::create(&partial).and_then(|file| {
            let mut writer = BufWriter::new(file);
            let bytes = transcode(member, &mut writer)?;
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            Ok(bytes)
        });

        match written {
            Ok(bytes) => {
                self.output.publish(&partial, name)?;
                Ok(bytes)
            },
            Err(e) => {
                if let Err(remove_err) = std::fs::remove_file(&partial) {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %remove_err, "Could not remove partial file");
                    }
                }
                Err(e.into())
            },
        }
    }
}

/// Final path component of a member, if it is a usable artifact name
fn output_name(enclosed: &Path) -> Option<String> {
    let name = enclosed.file_name()?.to_str()?.to_string();
    ArtifactStore::check_name(&name).ok()?;
    Some(name)
}
