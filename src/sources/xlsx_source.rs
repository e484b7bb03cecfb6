//! Spreadsheet data source (`.xlsx`, `.xlsm`, `.xlsb`, `.xls`, `.ods`).
//!
//! One worksheet is read: the named one, or the first in the workbook. Its first row holds
//! the column names; every following row that is not completely blank becomes a data row.
//! Cells keep the type the spreadsheet stored: text stays text (leading zeros included),
//! whole numbers become integers, dates become `YYYY-MM-DD[ HH:MM:SS]` text.

use anyhow::{Result, anyhow, bail};
use calamine::{Data, DataType, Reader, open_workbook_auto};
use chrono::Timelike;
use serde_json::{Number, Value};
use std::path::Path;
use tracing::{debug, warn};

use super::{DataSource, Row};
use crate::utils::interpolation::value_to_text;

/// Largest float that still converts to an integer without losing digits.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, Default)]
pub struct XlsxSource {
    sheet: Option<String>,
}

impl XlsxSource {
    /// Read the first worksheet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the worksheet called `name`.
    #[must_use]
    pub fn with_sheet(name: impl Into<String>) -> Self {
        Self {
            sheet: Some(name.into()),
        }
    }
}

impl DataSource for XlsxSource {
    fn name(&self) -> &'static str {
        "spreadsheet"
    }

    fn load(&self, path: &Path) -> Result<Vec<Row>> {
        let mut workbook = open_workbook_auto(path)
            .map_err(|e| anyhow!("Failed to open spreadsheet {}: {e}", path.display()))?;
        let names = workbook.sheet_names();
        let sheet = match &self.sheet {
            Some(wanted) if names.iter().any(|n| n == wanted) => wanted.clone(),
            Some(wanted) => bail!(
                "Worksheet '{}' not found in {} (available: {})",
                wanted,
                path.display(),
                names.join(", ")
            ),
            None => match names.first() {
                Some(first) => first.clone(),
                None => bail!("Spreadsheet {} has no worksheets", path.display()),
            },
        };
        let range = workbook
            .worksheet_range(&sheet)
            .map_err(|e| anyhow!("Failed to read worksheet '{sheet}' of {}: {e}", path.display()))?;

        let mut lines = range.rows();
        let Some(header) = lines.next() else {
            debug!(target: "macroflow::sources", sheet = %sheet, "Worksheet is empty");
            return Ok(Vec::new());
        };
        let columns: Vec<String> = header
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let name = value_to_text(&cell_value(cell)).trim().to_string();
                if name.is_empty() { format!("column_{}", i + 1) } else { name }
            })
            .collect();

        let rows: Vec<Row> = lines
            .filter(|cells| cells.iter().any(|c| !c.is_empty()))
            .map(|cells| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, name)| (name.clone(), cells.get(i).map_or(Value::Null, cell_value)))
                    .collect()
            })
            .collect();
        debug!(
            target: "macroflow::sources",
            sheet = %sheet, columns = columns.len(), rows = rows.len(),
            "Read worksheet"
        );
        Ok(rows)
    }
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
        Data::Int(i) => Value::Number((*i).into()),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_INT => {
            Value::Number((*f as i64).into())
        }
        Data::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(_) => match cell.as_datetime() {
            Some(dt) if dt.num_seconds_from_midnight() == 0 => {
                Value::String(dt.format("%Y-%m-%d").to_string())
            }
            Some(dt) => Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            None => Value::String(cell.to_string()),
        },
        Data::Error(e) => {
            warn!(target: "macroflow::sources", error = ?e, "Spreadsheet cell holds an error; using empty value");
            Value::Null
        }
    }
}
