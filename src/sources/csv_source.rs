//! CSV data source.
//!
//! The first record is the header row and supplies the column names. Cells are kept exactly as
//! written (`007`, `1E5` and 20-digit ids substitute verbatim); empty cells become null. Row
//! filters still compare numeric text numerically.
//!
//! Short records are padded with nulls; extra cells beyond the header are ignored.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use tracing::{trace, warn};

use super::{DataSource, Row};

/// Source that reads a delimited text file with a header row.
#[derive(Debug, Clone)]
pub struct CsvSource {
    delimiter: u8,
}

impl CsvSource {
    /// Comma-separated.
    #[must_use]
    pub fn new() -> Self {
        Self { delimiter: b',' }
    }

    /// Any single-byte delimiter (e.g. `b'\t'`, `b';'`).
    #[must_use]
    pub fn with_delimiter(delimiter: u8) -> Self {
        Self { delimiter }
    }

    fn read<R: std::io::Read>(&self, reader: R) -> Result<Vec<Row>> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_reader(reader);

        let headers: Vec<String> = rdr
            .headers()
            .context("Failed to read CSV header row")?
            .iter()
            .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
            .collect();

        let mut rows = Vec::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record.with_context(|| format!("Failed to read CSV record {}", line + 1))?;
            if record.len() > headers.len() {
                warn!(
                    target: "macroflow::sources",
                    record = line + 1, cells = record.len(), columns = headers.len(),
                    "CSV record has more cells than columns; extra cells ignored"
                );
            }
            let row: Row = headers
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), record.get(i).map_or(Value::Null, raw_cell)))
                .collect();
            trace!(target: "macroflow::sources", record = line + 1, "Parsed CSV record");
            rows.push(row);
        }
        Ok(rows)
    }
}

impl Default for CsvSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSource for CsvSource {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn load(&self, path: &Path) -> Result<Vec<Row>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open data file {}", path.display()))?;
        self.read(file)
            .with_context(|| format!("Failed to parse CSV data from {}", path.display()))
    }
}

fn raw_cell(raw: &str) -> Value {
    if raw.is_empty() {
        Value::Null
    } else {
        Value::String(raw.to_string())
    }
}
