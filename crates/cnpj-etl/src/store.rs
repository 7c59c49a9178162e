//! Analytical store backed by DuckDB
//!
//! Tables are only ever created whole: either by one `CREATE TABLE ... AS`
//! statement or inside a transaction. A table that exists is therefore
//! complete, which is what the load and refine stages rely on.

use crate::error::{EtlError, Result};
use crate::schema::Dataset;
use duckdb::{params, AccessMode, Config, Connection};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Quote `value` as a SQL string literal
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `['a', 'b']` list literal of file paths
fn path_list(files: &[PathBuf]) -> String {
    let items: Vec<String> = files
        .iter()
        .map(|f| sql_literal(&f.to_string_lossy()))
        .collect();
    format!("[{}]", items.join(", "))
}

/// One source file of a multi-file load and its `COPY` options
#[derive(Debug, Clone)]
pub struct CopySource {
    pub path: PathBuf,
    pub options: &'static str,
}

/// A DuckDB database file owned by one pipeline stage
pub struct AnalyticalStore {
    conn: Connection,
    path: PathBuf,
}

impl AnalyticalStore {
    /// Open or create a store, creating its parent directory if needed
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("SET preserve_insertion_order = false;")?;
        debug!(path = %path.display(), "Opened analytical store");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing store without write access
    pub fn open_read_only(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(EtlError::MissingInput {
                path: path.to_path_buf(),
            });
        }
        let config = Config::default().access_mode(AccessMode::ReadOnly)?;
        let conn = Connection::open_with_flags(path, config)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Underlying connection, for ad-hoc queries
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Whether `table` exists in this store's own catalog
    ///
    /// Tables of attached databases are not considered.
    pub fn has_table(&self, table: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM duckdb_tables() \
             WHERE database_name = current_database() AND schema_name = 'main' AND table_name = ?",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Tables of this store's own catalog, sorted by name
    pub fn tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT table_name FROM duckdb_tables() \
             WHERE database_name = current_database() AND schema_name = 'main' ORDER BY table_name",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tables = Vec::new();
        for row in rows {
            tables.push(row?);
        }
        Ok(tables)
    }

    pub fn row_count(&self, table: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Create `dataset.table` from semicolon-delimited, header-less files
    ///
    /// Values are cast to the declared column types; one that does not fit
    /// fails the statement and no table is created.
    pub fn create_table_from_csv(&self, dataset: &Dataset, files: &[PathBuf]) -> Result<()> {
        let sql = format!(
            "CREATE TABLE {table} AS SELECT * FROM read_csv({files}, \
             header = false, delim = ';', quote = '\"', escape = '\"', \
             auto_detect = false, columns = {columns})",
            table = dataset.table,
            files = path_list(files),
            columns = dataset.columns_struct(),
        );
        debug!(table = dataset.table, files = files.len(), "Creating table from delimited files");
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    /// Create `dataset.table` and fill it with one `COPY` per source
    ///
    /// Runs in a single transaction; any failure leaves no table behind.
    pub fn create_table_from_copies(&mut self, dataset: &Dataset, sources: &[CopySource]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            "CREATE TABLE {} ({})",
            dataset.table,
            dataset.column_definitions()
        ))?;
        for source in sources {
            debug!(table = dataset.table, file = %source.path.display(), options = source.options, "Copying file");
            tx.execute_batch(&format!(
                "COPY {} FROM {} ({})",
                dataset.table,
                sql_literal(&source.path.to_string_lossy()),
                source.options
            ))?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Create `table` from the result of `select`
    pub fn create_table_as(&self, table: &str, select: &str) -> Result<()> {
        debug!(table, "Creating table from query");
        self.conn
            .execute_batch(&format!("CREATE TABLE {table} AS {select}"))?;
        Ok(())
    }

    /// Attach another store under `alias` without write access
    pub fn attach_read_only(&self, path: &Path, alias: &str) -> Result<()> {
        if !path.is_file() {
            return Err(EtlError::MissingInput {
                path: path.to_path_buf(),
            });
        }
        let absolute = std::path::absolute(path)?;
        self.conn.execute_batch(&format!(
            "ATTACH {} AS {alias} (READ_ONLY)",
            sql_literal(&absolute.to_string_lossy())
        ))?;
        debug!(alias, path = %absolute.display(), "Attached input store");
        Ok(())
    }

    pub fn detach(&self, alias: &str) -> Result<()> {
        self.conn.execute_batch(&format!("DETACH {alias}"))?;
        debug!(alias, "Detached input store");
        Ok(())
    }
}
