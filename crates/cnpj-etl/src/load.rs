//! Stage 3: typed load
//!
//! Materializes every dataset as a typed table in the load store. A table
//! that already exists is left alone. Tax-regime files are inconsistent
//! across releases, so their layout is sniffed per file.

use crate::error::{EtlError, Result};
use crate::schema::{Dataset, DATASETS, TAX_REGIME};
use crate::store::{AnalyticalStore, CopySource};
use cnpj_common::artifact::ArtifactStore;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Header prefix of the comma-delimited tax-regime files
const TAX_REGIME_HEADER: &str = "ano,cnpj";

/// Outcome of a load run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Tables created during this run
    pub created: Vec<String>,
    /// Tables that already existed
    pub skipped: Vec<String>,
}

/// Delimiter and header convention of one tax-regime file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvLayout {
    /// `ano,cnpj,...` header line, comma-delimited
    CommaWithHeader,
    /// No header, semicolon-delimited
    SemicolonNoHeader,
}

impl CsvLayout {
    /// `COPY ... FROM` options for this layout
    pub fn copy_options(self) -> &'static str {
        match self {
            CsvLayout::CommaWithHeader => "FORMAT CSV, DELIMITER ',', HEADER true",
            CsvLayout::SemicolonNoHeader => "FORMAT CSV, DELIMITER ';', HEADER false, QUOTE '\"'",
        }
    }
}

/// Inspect the first line of a tax-regime file
pub fn sniff_layout(path: &Path) -> Result<CsvLayout> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut first_line = String::new();
    if reader.read_line(&mut first_line)? == 0 {
        return Err(EtlError::format(path, "file is empty"));
    }
    let first_line = first_line.trim_end_matches(['\r', '\n']);

    if first_line.starts_with(TAX_REGIME_HEADER) {
        return Ok(CsvLayout::CommaWithHeader);
    }

    let fields = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_reader(first_line.as_bytes())
        .records()
        .next()
        .and_then(|record| record.ok())
        .map(|record| record.len());

    match fields {
        Some(n) if n == TAX_REGIME.columns.len() => Ok(CsvLayout::SemicolonNoHeader),
        Some(n) => Err(EtlError::format(
            path,
            format!(
                "first line has {} ';'-separated fields and no '{}' header; expected {}",
                n,
                TAX_REGIME_HEADER,
                TAX_REGIME.columns.len()
            ),
        )),
        None => Err(EtlError::format(path, "first line is not delimited text")),
    }
}

/// Loads extracted files into the typed store
#[derive(Debug, Clone)]
pub struct Loader {
    input: ArtifactStore,
    store_path: PathBuf,
}

impl Loader {
    pub fn new(input: ArtifactStore, store_path: impl Into<PathBuf>) -> Self {
        Self {
            input,
            store_path: store_path.into(),
        }
    }

    /// Create every table that does not exist yet
    pub fn run(&self) -> Result<LoadReport> {
        let mut store = AnalyticalStore::open(&self.store_path)?;
        info!(store = %self.store_path.display(), "Starting typed load");

        let mut report = LoadReport::default();
        for dataset in DATASETS {
            if store.has_table(dataset.table)? {
                debug!(table = dataset.table, "Table exists, skipping");
                report.skipped.push(dataset.table.to_string());
                continue;
            }
            let files = self.input_files(dataset)?;
            store.create_table_from_csv(dataset, &files)?;
            info!(
                table = dataset.table,
                files = files.len(),
                rows = store.row_count(dataset.table)?,
                "Loaded table"
            );
            report.created.push(dataset.table.to_string());
        }

        if store.has_table(TAX_REGIME.table)? {
            debug!(table = TAX_REGIME.table, "Table exists, skipping");
            report.skipped.push(TAX_REGIME.table.to_string());
        } else {
            self.load_tax_regime(&mut store)?;
            report.created.push(TAX_REGIME.table.to_string());
        }

        info!(
            created = report.created.len(),
            skipped = report.skipped.len(),
            "Typed load complete"
        );
        Ok(report)
    }

    fn load_tax_regime(&self, store: &mut AnalyticalStore) -> Result<()> {
        let files = self.input_files(&TAX_REGIME)?;
        let sources = files
            .into_iter()
            .map(|path| {
                let layout = sniff_layout(&path)?;
                debug!(file = %path.display(), ?layout, "Sniffed tax-regime layout");
                Ok(CopySource {
                    path,
                    options: layout.copy_options(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        store.create_table_from_copies(&TAX_REGIME, &sources)?;
        info!(
            table = TAX_REGIME.table,
            files = sources.len(),
            rows = store.row_count(TAX_REGIME.table)?,
            "Loaded table"
        );
        Ok(())
    }

    fn input_files(&self, dataset: &Dataset) -> Result<Vec<PathBuf>> {
        let files = self.input.list(dataset.pattern)?;
        if files.is_empty() {
            return Err(EtlError::NoInputFiles {
                dataset: dataset.table.to_string(),
                pattern: dataset.pattern.to_string(),
            });
        }
        Ok(files)
    }
}
