/*!
Data sources for data loops.

A `data_loop_start` action names a file; the engine asks a [`DataSource`] for all of its rows
once, applies the optional row filter, and then replays the loop body once per row. Rows are
never refreshed while the loop runs.

Concrete loaders live in their own files:

- `xlsx_source.rs` -> `XlsxSource` (one worksheet of a spreadsheet, header row first)
- `csv_source.rs`  -> `CsvSource`  (header row + records, cells kept as written)
- `json_source.rs` -> `JsonSource` (array of objects)

[`FileDataSource`] picks one of them by file extension and is what the engine uses unless a
different source is injected. [`MemorySource`] serves fixed tables and is handy for previews
and tests.
*/

use anyhow::{Result, bail};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{DataLoopParams, FilterOp, RowFilter};
use crate::utils::interpolation::value_to_text;

pub mod csv_source;
pub mod json_source;
pub mod xlsx_source;

pub use csv_source::CsvSource;
pub use json_source::JsonSource;
pub use xlsx_source::XlsxSource;

/// One data row: column name -> cell value.
pub type Row = BTreeMap<String, Value>;

/// Trait implemented by all row loaders.
pub trait DataSource: Send + Sync {
    /// Static human-readable identifier (used in logs).
    fn name(&self) -> &'static str;

    /// Read every row of `path`, in file order.
    fn load(&self, path: &Path) -> Result<Vec<Row>>;

    /// Read the rows of one worksheet. Sources without worksheets ignore `sheet`.
    fn load_sheet(&self, path: &Path, sheet: Option<&str>) -> Result<Vec<Row>> {
        if let Some(sheet) = sheet {
            warn!(
                target: "macroflow::sources",
                source = self.name(), sheet, path = %path.display(),
                "Source has no worksheets; sheet ignored"
            );
        }
        self.load(path)
    }
}

/// Dispatches on file extension: spreadsheets -> [`XlsxSource`], `.csv`/`.tsv` ->
/// [`CsvSource`], `.json` -> [`JsonSource`].
#[derive(Debug, Clone, Default)]
pub struct FileDataSource;

impl DataSource for FileDataSource {
    fn name(&self) -> &'static str {
        "file"
    }

    fn load(&self, path: &Path) -> Result<Vec<Row>> {
        self.load_sheet(path, None)
    }

    fn load_sheet(&self, path: &Path, sheet: Option<&str>) -> Result<Vec<Row>> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => match sheet {
                Some(name) => XlsxSource::with_sheet(name).load(path),
                None => XlsxSource::new().load(path),
            },
            "csv" => CsvSource::new().load(path),
            "tsv" => CsvSource::with_delimiter(b'\t').load(path),
            "json" => JsonSource.load(path),
            other => bail!(
                "Unsupported data file type '{}' for {}",
                other,
                path.display()
            ),
        }
    }
}

/// Fixed in-memory tables keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    tables: HashMap<PathBuf, Vec<Row>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `rows` under `path` (builder style).
    pub fn with_table(mut self, path: impl Into<PathBuf>, rows: Vec<Row>) -> Self {
        self.tables.insert(path.into(), rows);
        self
    }
}

impl DataSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&self, path: &Path) -> Result<Vec<Row>> {
        match self.tables.get(path) {
            Some(rows) => Ok(rows.clone()),
            None => bail!("No in-memory table registered for {}", path.display()),
        }
    }
}

/// Load the rows for a data loop: read, filter, then cap at `max_rows`.
pub fn load_rows(source: &dyn DataSource, params: &DataLoopParams) -> Result<Vec<Row>> {
    let mut rows = source.load_sheet(&params.source, params.sheet.as_deref())?;
    let loaded = rows.len();

    if let Some(filter) = &params.filter {
        rows = apply_filter(rows, filter);
        debug!(
            target: "macroflow::sources",
            column = %filter.column, operator = ?filter.operator,
            before = loaded, after = rows.len(),
            "Applied row filter"
        );
    }
    if let Some(max) = params.max_rows {
        rows.truncate(max);
    }

    info!(
        target: "macroflow::sources",
        source = source.name(), path = %params.source.display(), rows = rows.len(),
        "Loaded data rows"
    );
    Ok(rows)
}

/// Keep the rows whose `filter.column` satisfies the filter. Rows missing the column are dropped.
pub fn apply_filter(rows: Vec<Row>, filter: &RowFilter) -> Vec<Row> {
    rows.into_iter()
        .filter(|row| {
            row.get(&filter.column)
                .is_some_and(|cell| matches_filter(cell, filter.operator, &filter.value))
        })
        .collect()
}

fn matches_filter(cell: &Value, op: FilterOp, expected: &Value) -> bool {
    match op {
        FilterOp::Eq => compare(cell, expected) == Some(Ordering::Equal),
        FilterOp::Ne => compare(cell, expected) != Some(Ordering::Equal),
        FilterOp::Gt => compare(cell, expected) == Some(Ordering::Greater),
        FilterOp::Ge => matches!(
            compare(cell, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::Lt => compare(cell, expected) == Some(Ordering::Less),
        FilterOp::Le => matches!(
            compare(cell, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::Contains => value_to_text(cell).contains(&value_to_text(expected)),
    }
}

/// Numeric comparison when both sides are numbers (or numeric text), text comparison otherwise.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => Some(value_to_text(a).cmp(&value_to_text(b))),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn table() -> Vec<Row> {
        vec![
            row(&[("name", json!("kim")), ("age", json!(31))]),
            row(&[("name", json!("lee")), ("age", json!(17))]),
            row(&[("name", json!("park")), ("age", json!("45"))]),
        ]
    }

    fn names(rows: &[Row]) -> Vec<String> {
        rows.iter().map(|r| value_to_text(&r["name"])).collect()
    }

    #[test]
    fn test_numeric_filters() {
        let filter = RowFilter {
            column: "age".into(),
            operator: FilterOp::Ge,
            value: json!(30),
        };
        assert_eq!(names(&apply_filter(table(), &filter)), vec!["kim", "park"]);

        let filter = RowFilter {
            column: "age".into(),
            operator: FilterOp::Lt,
            value: json!("20"),
        };
        assert_eq!(names(&apply_filter(table(), &filter)), vec!["lee"]);
    }

    #[test]
    fn test_text_filters() {
        let filter = RowFilter {
            column: "name".into(),
            operator: FilterOp::Contains,
            value: json!("ar"),
        };
        assert_eq!(names(&apply_filter(table(), &filter)), vec!["park"]);

        let filter = RowFilter {
            column: "name".into(),
            operator: FilterOp::Ne,
            value: json!("kim"),
        };
        assert_eq!(names(&apply_filter(table(), &filter)), vec!["lee", "park"]);

        let filter = RowFilter {
            column: "missing".into(),
            operator: FilterOp::Ne,
            value: json!("x"),
        };
        assert!(apply_filter(table(), &filter).is_empty());
    }

    #[test]
    fn test_load_rows_filters_and_caps() {
        let source = MemorySource::new().with_table("people", table());
        let params = DataLoopParams {
            source: "people".into(),
            sheet: None,
            filter: Some(RowFilter {
                column: "age".into(),
                operator: FilterOp::Gt,
                value: json!(10),
            }),
            max_rows: Some(2),
        };
        let rows = load_rows(&source, &params).unwrap();
        assert_eq!(names(&rows), vec!["kim", "lee"]);
    }

    #[test]
    fn test_unknown_extension_and_missing_table() {
        let err = FileDataSource.load(Path::new("rows.txt")).unwrap_err();
        assert!(err.to_string().contains("Unsupported data file type 'txt'"));
        assert!(MemorySource::new().load(Path::new("nope")).is_err());
    }

    #[test]
    fn test_sheet_is_ignored_by_flat_sources() {
        let source = MemorySource::new().with_table("people", table());
        let rows = source.load_sheet(Path::new("people"), Some("Sheet2")).unwrap();
        assert_eq!(rows.len(), 3);
    }
}
