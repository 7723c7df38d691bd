//! Output contract: one calendar-date column, one numeric signal column,
//! no missing values in either.
//!
//! The engine never coerces: a missing value or a non-numeric signal is a
//! violation the producing code has to fix. Extra columns are tolerated and
//! projected away when the output is persisted.

use std::path::Path;

use chrono::NaiveDate;
use serde::Serialize;

use super::csv::{self, Table};

const DATE_COLUMNS: [&str; 3] = ["date", "datetime", "timestamp"];
const DEFAULT_SIGNAL: &str = "signal";
const MISSING_TOKENS: [&str; 8] = ["", "nan", "na", "n/a", "null", "none", "nat", "<na>"];

/// Ways a produced file can fail the contract.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractViolation {
    #[error("output has no data rows")]
    Empty,

    #[error("missing required column '{column}' (found columns: {found})")]
    MissingColumn { column: String, found: String },

    #[error("wrong column type: '{column}' must be {expected}, found '{value}' at row {row}")]
    WrongColumnType {
        column: String,
        expected: String,
        row: usize,
        value: String,
    },

    #[error("column '{column}' has missing values (first at row {row}); drop them before writing")]
    MissingValues { column: String, row: usize },

    #[error("output could not be read: {0}")]
    Unreadable(String),
}

/// Facts about an accepted output, for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSummary {
    pub signal_column: String,
    pub rows: usize,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub min: f64,
    pub max: f64,
    pub last: f64,
}

/// An output that satisfied the contract, reduced to its two columns.
#[derive(Debug, Clone)]
pub struct ValidatedOutput {
    pub signal_column: String,
    pub rows: Vec<(NaiveDate, f64)>,
    pub summary: OutputSummary,
}

impl ValidatedOutput {
    /// Write exactly the two contract columns.
    pub fn write_csv(&self, path: &Path) -> std::io::Result<()> {
        let mut out = format!("date,{}\n", self.signal_column);
        for (date, value) in &self.rows {
            out.push_str(&format!("{},{}\n", date.format("%Y-%m-%d"), value));
        }
        std::fs::write(path, out)
    }
}

/// Schema check for produced tabular output.
#[derive(Debug, Clone, Default)]
pub struct OutputContract {
    /// Preferred signal column name; falls back to `signal`, then to the
    /// only non-date column.
    pub signal_column: Option<String>,
}

impl OutputContract {
    pub fn new(signal_column: Option<String>) -> Self {
        Self { signal_column }
    }

    pub fn validate_file(&self, path: &Path) -> Result<ValidatedOutput, ContractViolation> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ContractViolation::Unreadable(format!("{}: {e}", path.display())))?;
        self.validate(&text)
    }

    pub fn validate(&self, text: &str) -> Result<ValidatedOutput, ContractViolation> {
        let table = csv::parse(text).ok_or(ContractViolation::Empty)?;
        let date_idx = find_date_column(&table).ok_or_else(|| ContractViolation::MissingColumn {
            column: "date".into(),
            found: found_columns(&table),
        })?;
        let signal_idx = self.find_signal_column(&table, date_idx).ok_or_else(|| {
            ContractViolation::MissingColumn {
                column: self
                    .signal_column
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SIGNAL.into()),
                found: found_columns(&table),
            }
        })?;
        if table.rows.is_empty() {
            return Err(ContractViolation::Empty);
        }

        let date_name = &table.header[date_idx];
        let signal_name = &table.header[signal_idx];
        let mut rows = Vec::with_capacity(table.rows.len());

        for i in 0..table.rows.len() {
            let row = i + 1;
            let raw_date = table.cell(i, date_idx).trim();
            let raw_signal = table.cell(i, signal_idx).trim();

            if is_missing(raw_date) {
                return Err(ContractViolation::MissingValues {
                    column: date_name.clone(),
                    row,
                });
            }
            if is_missing(raw_signal) {
                return Err(ContractViolation::MissingValues {
                    column: signal_name.clone(),
                    row,
                });
            }
            let date = parse_date(raw_date).ok_or_else(|| ContractViolation::WrongColumnType {
                column: date_name.clone(),
                expected: "a calendar date".into(),
                row,
                value: raw_date.into(),
            })?;
            let value = raw_signal
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ContractViolation::WrongColumnType {
                    column: signal_name.clone(),
                    expected: "numeric".into(),
                    row,
                    value: raw_signal.into(),
                })?;
            rows.push((date, value));
        }

        let summary = summarize(signal_name, &rows);
        Ok(ValidatedOutput {
            signal_column: signal_name.clone(),
            rows,
            summary,
        })
    }

    fn find_signal_column(&self, table: &Table, date_idx: usize) -> Option<usize> {
        let by_name = |name: &str| {
            table
                .header
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .filter(|i| *i != date_idx)
        };
        if let Some(idx) = self.signal_column.as_deref().and_then(by_name) {
            return Some(idx);
        }
        if let Some(idx) = by_name(DEFAULT_SIGNAL) {
            return Some(idx);
        }
        let others: Vec<usize> = table
            .header
            .iter()
            .enumerate()
            .filter(|(i, h)| *i != date_idx && !is_index_column(h))
            .map(|(i, _)| i)
            .collect();
        match others.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }
}

fn find_date_column(table: &Table) -> Option<usize> {
    DATE_COLUMNS.iter().find_map(|name| {
        table
            .header
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
    })
}

/// Unnamed index columns written by dataframe libraries.
fn is_index_column(name: &str) -> bool {
    name.is_empty() || name.starts_with("Unnamed")
}

fn found_columns(table: &Table) -> String {
    table
        .header
        .iter()
        .filter(|h| !is_index_column(h))
        .cloned()
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_missing(value: &str) -> bool {
    MISSING_TOKENS
        .iter()
        .any(|t| value.eq_ignore_ascii_case(t))
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(value, fmt) {
            return Some(d);
        }
    }
    // "2024-01-02 00:00:00", "2024-01-02T00:00:00Z", ...
    value
        .get(..10)
        .filter(|_| value.len() > 10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
}

fn summarize(signal_column: &str, rows: &[(NaiveDate, f64)]) -> OutputSummary {
    let (min, max) = rows
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, v)| {
            (lo.min(*v), hi.max(*v))
        });
    OutputSummary {
        signal_column: signal_column.to_string(),
        rows: rows.len(),
        first_date: rows[0].0,
        last_date: rows[rows.len() - 1].0,
        min,
        max,
        last: rows[rows.len() - 1].1,
    }
}
