//! Dataset schema introspection for prompt context

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;

use super::sqlite::{open_read_only, run_query};
use crate::config::DatabaseSettings;
use crate::error::ExecutionError;
use crate::stages::writer::format_rows_markdown;
use crate::types::RowSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub row_count: u64,
    pub sample: Option<RowSet>,
}

/// Tables, columns and optional samples of a dataset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub tables: Vec<TableInfo>,
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn engine(err: rusqlite::Error) -> ExecutionError {
    ExecutionError::Engine(err.to_string())
}

impl DatasetSchema {
    /// Read the schema of the configured SQLite file
    pub fn from_settings(settings: &DatabaseSettings) -> Result<Self, ExecutionError> {
        let conn = open_read_only(&settings.path, settings.busy_timeout())?;

        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                 ORDER BY name",
            )
            .map_err(engine)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(engine)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(engine)?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let quoted = quote_identifier(&name);

            let mut info = conn
                .prepare(&format!("PRAGMA table_info({})", quoted))
                .map_err(engine)?;
            let columns = info
                .query_map([], |row| {
                    Ok(ColumnInfo {
                        name: row.get(1)?,
                        data_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    })
                })
                .map_err(engine)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(engine)?;

            let row_count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", quoted), [], |row| row.get(0))
                .map_err(engine)?;

            let sample = if settings.include_samples && settings.sample_rows > 0 {
                let statement = format!("SELECT * FROM {} LIMIT {}", quoted, settings.sample_rows);
                Some(run_query(&conn, &statement, settings.sample_rows)?)
            } else {
                None
            };

            tables.push(TableInfo {
                name,
                columns,
                row_count: row_count.max(0) as u64,
                sample,
            });
        }

        Ok(Self { tables })
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Every table and column name
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for table in &self.tables {
            out.insert(table.name.clone());
            for column in &table.columns {
                out.insert(column.name.clone());
            }
        }
        out
    }

    /// Text block describing the dataset for prompts
    pub fn render_context(&self) -> String {
        if self.tables.is_empty() {
            return "(the dataset has no tables)".to_string();
        }

        let mut out = String::new();
        for table in &self.tables {
            let _ = writeln!(out, "Table {} ({} rows)", table.name, table.row_count);
            for column in &table.columns {
                if column.data_type.is_empty() {
                    let _ = writeln!(out, "  - {}", column.name);
                } else {
                    let _ = writeln!(out, "  - {} {}", column.name, column.data_type);
                }
            }
            if let Some(sample) = table.sample.as_ref().filter(|s| !s.rows.is_empty()) {
                let _ = writeln!(out, "  Sample rows:");
                for line in format_rows_markdown(&sample.columns, &sample.rows, sample.rows.len()).lines() {
                    let _ = writeln!(out, "  {}", line);
                }
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}
