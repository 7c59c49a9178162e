//! Stage 4: refinement
//!
//! Builds the refined store from the load store, attached read-only:
//!
//! - `empresa`: companies left-joined with their Simples/MEI options, capital
//!   parsed from the Brazilian number format and dates from `YYYYMMDD`
//! - `estabelecimento`: establishments left-joined with the tax regime of the
//!   most recent year on record, with placeholder house numbers and postal
//!   codes cleaned up
//! - code tables copied through unchanged

use crate::error::{EtlError, Result};
use crate::store::{sql_literal, AnalyticalStore};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Alias of the attached load store
const INPUT: &str = "input";

/// Code tables copied verbatim
pub const REFERENCE_TABLES: &[&str] = &["cnae", "motivo", "municipio", "natureza_juridica", "pais"];

/// House numbers meaning "no number"; matched exactly and case-sensitively
pub const NO_NUMBER_TOKENS: &[&str] = &[
    "S/N", "SN", "S N", "sn", "s/n", "S/Nº", "S/N.", "-", "S/NR", ".", "Sn", "SNR", "S.N", "S-N", "SEM", "SEM NM",
    "SEM NU", r"S\N", "S/n", "0", "00", "000", "0000", "00000", "000000",
];

// ============================================================================
// Canonical Identifier
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CnpjError {
    #[error("CNPJ fragment out of range: {0}")]
    OutOfRange(&'static str),

    #[error("Malformed CNPJ '{0}': expected NN.NNN.NNN/OOOO-DD or 14 digits")]
    Malformed(String),
}

/// Entity identifier assembled from its three registry fragments
///
/// Formats as `NN.NNN.NNN/OOOO-DD`, the form used by the tax-regime files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cnpj {
    base: u32,
    order: u16,
    check: u8,
}

impl Cnpj {
    pub fn new(base: u32, order: u16, check: u8) -> std::result::Result<Self, CnpjError> {
        if base > 99_999_999 {
            return Err(CnpjError::OutOfRange("base"));
        }
        if order > 9_999 {
            return Err(CnpjError::OutOfRange("order"));
        }
        if check > 99 {
            return Err(CnpjError::OutOfRange("check"));
        }
        Ok(Self { base, order, check })
    }

    /// 8-digit root shared by all establishments of a company
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn order(&self) -> u16 {
        self.order
    }

    pub fn check(&self) -> u8 {
        self.check
    }
}

impl fmt::Display for Cnpj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}.{:03}.{:03}/{:04}-{:02}",
            self.base / 1_000_000,
            self.base / 1_000 % 1_000,
            self.base % 1_000,
            self.order,
            self.check
        )
    }
}

impl FromStr for Cnpj {
    type Err = CnpjError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let malformed = || CnpjError::Malformed(s.to_string());

        let digits: String = if s.len() == 18 {
            let bytes = s.as_bytes();
            let separators = [(2, b'.'), (6, b'.'), (10, b'/'), (15, b'-')];
            if separators.iter().any(|&(i, c)| bytes[i] != c) {
                return Err(malformed());
            }
            s.chars().filter(|c| !matches!(c, '.' | '/' | '-')).collect()
        } else {
            s.to_string()
        };

        if digits.len() != 14 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }

        let base = digits[..8].parse().map_err(|_| malformed())?;
        let order = digits[8..12].parse().map_err(|_| malformed())?;
        let check = digits[12..].parse().map_err(|_| malformed())?;
        Self::new(base, order, check)
    }
}

/// SQL expression producing the same text as [`Cnpj`]'s `Display`
pub fn cnpj_sql(base: &str, order: &str, check: &str) -> String {
    let padded_base = format!("lpad(CAST({base} AS VARCHAR), 8, '0')");
    format!(
        "substr({b}, 1, 2) || '.' || substr({b}, 3, 3) || '.' || substr({b}, 6, 3) || '/' || \
         lpad(CAST({order} AS VARCHAR), 4, '0') || '-' || lpad(CAST({check} AS VARCHAR), 2, '0')",
        b = padded_base
    )
}

// ============================================================================
// Table Queries
// ============================================================================

/// `YYYYMMDD` text to DATE; anything unparsable becomes NULL
fn date_sql(column: &str) -> String {
    format!("CAST(try_strptime({column}, '%Y%m%d') AS DATE)")
}

/// "1.234,56" to 1234.56; zero becomes NULL
fn capital_sql(column: &str) -> String {
    format!("NULLIF(TRY_CAST(replace(replace({column}, '.', ''), ',', '.') AS DECIMAL(18, 2)), 0)")
}

fn no_number_list() -> String {
    NO_NUMBER_TOKENS
        .iter()
        .map(|t| sql_literal(t))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn empresa_sql() -> String {
    format!(
        "SELECT
            e.cnpj_base,
            e.razao_social,
            e.natureza_juridica,
            e.qualificacao_responsavel,
            {capital} AS capital_social,
            e.porte_empresa,
            e.ente_federativo_responsavel,
            s.opcao_simples = 'S' AS opcao_simples,
            {data_opcao_simples} AS data_opcao_simples,
            {data_exclusao_simples} AS data_exclusao_simples,
            s.opcao_mei = 'S' AS opcao_mei,
            {data_opcao_mei} AS data_opcao_mei,
            {data_exclusao_mei} AS data_exclusao_mei
        FROM {INPUT}.empresa AS e
        LEFT JOIN {INPUT}.simples AS s ON s.cnpj_base = e.cnpj_base",
        capital = capital_sql("e.capital_social_str"),
        data_opcao_simples = date_sql("s.data_opcao_simples"),
        data_exclusao_simples = date_sql("s.data_exclusao_simples"),
        data_opcao_mei = date_sql("s.data_opcao_mei"),
        data_exclusao_mei = date_sql("s.data_exclusao_mei"),
    )
}

/// Establishments with the tax regime of each entity's latest year
///
/// When several regimes share the latest year, `arg_max` returns one of
/// them; which one is not defined.
pub fn estabelecimento_sql() -> String {
    format!(
        "WITH rt AS (
            SELECT cnpj, arg_max(tributacao, ano) AS regime_tributacao
            FROM {INPUT}.regime_tributacao
            GROUP BY cnpj
        )
        SELECT
            e.cnpj_base,
            e.cnpj_ordem,
            e.cnpj_dv,
            e.matriz = 1 AS matriz,
            e.nome_fantasia,
            e.situacao_cadastral,
            {data_situacao_cadastral} AS data_situacao_cadastral,
            e.motivo_situacao_cadastral,
            e.nome_cidade_exterior,
            e.pais,
            {data_inicio_atividades} AS data_inicio_atividades,
            e.cnae,
            e.cnae_secundario,
            e.tipo_logradouro,
            e.logradouro,
            CASE WHEN e.numero IN ({no_number}) THEN NULL ELSE e.numero END AS numero,
            e.complemento,
            e.bairro,
            LPAD(NULLIF(e.cep, '0'), 8, '0') AS cep,
            e.uf,
            e.municipio,
            e.ddd1,
            e.telefone1,
            e.ddd2,
            e.telefone2,
            e.ddd_fax,
            e.fax,
            e.correio_eletronico,
            e.situacao_especial,
            {data_situacao_especial} AS data_situacao_especial,
            rt.regime_tributacao
        FROM {INPUT}.estabelecimento AS e
        LEFT JOIN rt ON rt.cnpj = {cnpj}",
        data_situacao_cadastral = date_sql("e.data_situacao_cadastral"),
        data_inicio_atividades = date_sql("e.data_inicio_atividades"),
        no_number = no_number_list(),
        data_situacao_especial = date_sql("e.data_situacao_especial"),
        cnpj = cnpj_sql("e.cnpj_base", "e.cnpj_ordem", "e.cnpj_dv"),
    )
}

/// Every refined table and the query that builds it, in build order
pub fn refined_tables() -> Vec<(&'static str, String)> {
    let mut tables = vec![("empresa", empresa_sql()), ("estabelecimento", estabelecimento_sql())];
    tables.extend(
        REFERENCE_TABLES
            .iter()
            .map(|table| (*table, format!("SELECT * FROM {INPUT}.{table}"))),
    );
    tables
}

// ============================================================================
// Refiner
// ============================================================================

/// Outcome of a refine run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefineReport {
    /// Tables created during this run
    pub created: Vec<String>,
    /// Tables that already existed
    pub skipped: Vec<String>,
}

/// Builds the refined store from the load store
#[derive(Debug, Clone)]
pub struct Refiner {
    input_store: PathBuf,
    output_store: PathBuf,
}

impl Refiner {
    pub fn new(input_store: impl Into<PathBuf>, output_store: impl Into<PathBuf>) -> Self {
        Self {
            input_store: input_store.into(),
            output_store: output_store.into(),
        }
    }

    /// Create every refined table that does not exist yet
    ///
    /// The input store is detached before returning, also on failure.
    pub fn run(&self) -> Result<RefineReport> {
        if !self.input_store.is_file() {
            return Err(EtlError::MissingInput {
                path: self.input_store.clone(),
            });
        }
        let store = AnalyticalStore::open(&self.output_store)?;
        store.attach_read_only(&self.input_store, INPUT)?;
        info!(
            input = %self.input_store.display(),
            output = %self.output_store.display(),
            "Starting refinement"
        );

        let built = self.build_tables(&store);
        let detached = store.detach(INPUT);
        if let (Err(_), Err(e)) = (&built, &detached) {
            warn!(error = %e, "Failed to detach input store after a failed build");
        }
        let report = built?;
        detached?;

        info!(
            created = report.created.len(),
            skipped = report.skipped.len(),
            "Refinement complete"
        );
        Ok(report)
    }

    fn build_tables(&self, store: &AnalyticalStore) -> Result<RefineReport> {
        let mut report = RefineReport::default();
        for (table, select) in refined_tables() {
            if store.has_table(table)? {
                debug!(table, "Table exists, skipping");
                report.skipped.push(table.to_string());
                continue;
            }
            store.create_table_as(table, &select)?;
            info!(table, rows = store.row_count(table)?, "Refined table");
            report.created.push(table.to_string());
        }
        Ok(report)
    }
}
