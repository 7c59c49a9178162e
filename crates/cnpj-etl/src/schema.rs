//! Declarative dataset schemas
//!
//! Each dataset is a table name, a file pattern in the extraction directory,
//! and an ordered column list. The generic loader consumes these as data;
//! only the tax-regime dataset takes a separate code path.

/// Column types used by the source files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    UInt32,
    UInt16,
    UInt8,
    Text,
}

impl ColumnType {
    /// DuckDB type name
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::UInt32 => "UINTEGER",
            ColumnType::UInt16 => "USMALLINT",
            ColumnType::UInt8 => "UTINYINT",
            ColumnType::Text => "VARCHAR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

use ColumnType::{Text, UInt16, UInt32, UInt8};

/// A table loaded from every extracted file matching `pattern`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dataset {
    pub table: &'static str,
    pub pattern: &'static str,
    pub columns: &'static [Column],
}

impl Dataset {
    /// `{'name': 'TYPE', ...}` as accepted by `read_csv(columns = ...)`
    pub fn columns_struct(&self) -> String {
        let fields: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("'{}': '{}'", c.name, c.ty.sql()))
            .collect();
        format!("{{{}}}", fields.join(", "))
    }

    /// `name TYPE, ...` for a `CREATE TABLE` column list
    pub fn column_definitions(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.ty.sql()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

const CNAE_COLUMNS: &[Column] = &[col("codigo", UInt32), col("descricao", Text)];

/// Shared by the small code tables
const SATELLITE_COLUMNS: &[Column] = &[col("codigo", UInt16), col("descricao", Text)];

const EMPRESA_COLUMNS: &[Column] = &[
    col("cnpj_base", UInt32),
    col("razao_social", Text),
    col("natureza_juridica", UInt16),
    col("qualificacao_responsavel", UInt8),
    col("capital_social_str", Text),
    col("porte_empresa", UInt8),
    col("ente_federativo_responsavel", Text),
];

const ESTABELECIMENTO_COLUMNS: &[Column] = &[
    col("cnpj_base", UInt32),
    col("cnpj_ordem", UInt16),
    col("cnpj_dv", UInt8),
    col("matriz", UInt8),
    col("nome_fantasia", Text),
    col("situacao_cadastral", UInt8),
    col("data_situacao_cadastral", Text),
    col("motivo_situacao_cadastral", UInt8),
    col("nome_cidade_exterior", Text),
    col("pais", Text),
    col("data_inicio_atividades", Text),
    col("cnae", Text),
    col("cnae_secundario", Text),
    col("tipo_logradouro", Text),
    col("logradouro", Text),
    col("numero", Text),
    col("complemento", Text),
    col("bairro", Text),
    col("cep", Text),
    col("uf", Text),
    col("municipio", UInt16),
    col("ddd1", Text),
    col("telefone1", Text),
    col("ddd2", Text),
    col("telefone2", Text),
    col("ddd_fax", Text),
    col("fax", Text),
    col("correio_eletronico", Text),
    col("situacao_especial", Text),
    col("data_situacao_especial", Text),
];

const SIMPLES_COLUMNS: &[Column] = &[
    col("cnpj_base", UInt32),
    col("opcao_simples", Text),
    col("data_opcao_simples", Text),
    col("data_exclusao_simples", Text),
    col("opcao_mei", Text),
    col("data_opcao_mei", Text),
    col("data_exclusao_mei", Text),
];

const TAX_REGIME_COLUMNS: &[Column] = &[
    col("ano", UInt16),
    col("cnpj", Text),
    col("cnpj_scp", Text),
    col("tributacao", Text),
    col("qtd", UInt8),
];

/// Datasets loaded by the generic path, in load order
pub const DATASETS: &[Dataset] = &[
    Dataset {
        table: "cnae",
        pattern: "*.CNAECSV",
        columns: CNAE_COLUMNS,
    },
    Dataset {
        table: "motivo",
        pattern: "*.MOTICSV",
        columns: SATELLITE_COLUMNS,
    },
    Dataset {
        table: "municipio",
        pattern: "*.MUNICCSV",
        columns: SATELLITE_COLUMNS,
    },
    Dataset {
        table: "natureza_juridica",
        pattern: "*.NATJUCSV",
        columns: SATELLITE_COLUMNS,
    },
    Dataset {
        table: "pais",
        pattern: "*.PAISCSV",
        columns: SATELLITE_COLUMNS,
    },
    Dataset {
        table: "empresa",
        pattern: "*.EMPRECSV",
        columns: EMPRESA_COLUMNS,
    },
    Dataset {
        table: "estabelecimento",
        pattern: "*.ESTABELE",
        columns: ESTABELECIMENTO_COLUMNS,
    },
    Dataset {
        table: "simples",
        pattern: "*.SIMPLES.CSV.*",
        columns: SIMPLES_COLUMNS,
    },
];

/// Yearly tax-regime records; files vary in delimiter and header
pub const TAX_REGIME: Dataset = Dataset {
    table: "regime_tributacao",
    pattern: "*.csv",
    columns: TAX_REGIME_COLUMNS,
};

/// Every table the load stage produces
pub fn loaded_tables() -> impl Iterator<Item = &'static str> {
    DATASETS
        .iter()
        .chain(std::iter::once(&TAX_REGIME))
        .map(|d| d.table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_table_names_are_unique() {
        let tables: HashSet<_> = loaded_tables().collect();
        assert_eq!(tables.len(), DATASETS.len() + 1);
    }

    #[test]
    fn test_column_counts() {
        let count = |table: &str| {
            DATASETS
                .iter()
                .find(|d| d.table == table)
                .map(|d| d.columns.len())
        };
        assert_eq!(count("cnae"), Some(2));
        assert_eq!(count("empresa"), Some(7));
        assert_eq!(count("estabelecimento"), Some(30));
        assert_eq!(count("simples"), Some(7));
        assert_eq!(TAX_REGIME.columns.len(), 5);
    }

    #[test]
    fn test_columns_struct() {
        let cnae = DATASETS[0];
        assert_eq!(cnae.columns_struct(), "{'codigo': 'UINTEGER', 'descricao': 'VARCHAR'}");
    }

    #[test]
    fn test_column_definitions() {
        assert_eq!(
            TAX_REGIME.column_definitions(),
            "ano USMALLINT, cnpj VARCHAR, cnpj_scp VARCHAR, tributacao VARCHAR, qtd UTINYINT"
        );
    }
}
