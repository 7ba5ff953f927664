// src/load/mod.rs
use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use std::{
    collections::HashSet,
    fmt,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

use crate::error::{AnonError, AnonResult};

/// Date layout used by the survey export for `birthdate`.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Declared type of an input column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Number,
    Date,
}

/// A single typed cell.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Missing,
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Number(n) => write!(f, "{}", n),
            Value::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Value::Missing => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RawTable {
    /// Column names, from the CSV header row.
    pub headers: Vec<String>,
    /// Each data row, one cleaned string per header.
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Parse every cell according to `type_of(header)`.
    /// Empty cells become `Value::Missing`; anything unparseable is a schema error.
    pub fn typed<F>(&self, type_of: F) -> AnonResult<Vec<Vec<Value>>>
    where
        F: Fn(&str) -> Option<FieldType>,
    {
        let types = self
            .headers
            .iter()
            .map(|h| {
                type_of(h).ok_or_else(|| AnonError::Schema(format!("no declared type for `{}`", h)))
            })
            .collect::<AnonResult<Vec<_>>>()?;

        self.rows
            .iter()
            .enumerate()
            .map(|(row_idx, row)| {
                if row.len() != self.headers.len() {
                    return Err(AnonError::Schema(format!(
                        "row {}: {} cells for {} fields",
                        row_idx,
                        row.len(),
                        self.headers.len()
                    )));
                }
                row.iter()
                    .zip(&types)
                    .zip(&self.headers)
                    .map(|((cell, ty), name)| {
                        parse_value(*ty, cell).ok_or_else(|| {
                            AnonError::Schema(format!(
                                "row {}: `{}` is not a valid {:?} for field `{}`",
                                row_idx, cell, ty, name
                            ))
                        })
                    })
                    .collect()
            })
            .collect()
    }
}

/// Trim whitespace + strip outer quotes if present. Header names only: the
/// csv reader has already unquoted cells, so a second pass would eat data.
pub fn clean_str(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        trimmed[1..trimmed.len() - 1].trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Parse a cleaned cell into a typed value. `None` means the cell is malformed.
pub fn parse_value(ty: FieldType, raw: &str) -> Option<Value> {
    let s = raw.trim();
    if s.is_empty() {
        return Some(Value::Missing);
    }
    match ty {
        FieldType::Text => Some(Value::Text(s.to_string())),
        FieldType::Number => s.parse::<f64>().ok().filter(|n| n.is_finite()).map(Value::Number),
        FieldType::Date => NaiveDate::parse_from_str(s, DATE_FORMAT).ok().map(Value::Date),
    }
}

/// Parse a headed CSV stream into a `RawTable`, preserving row order.
pub fn read_csv<R: Read>(reader: R) -> Result<RawTable> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()
        .context("reading CSV header row")?
        .iter()
        .map(clean_str)
        .collect();

    let mut seen = HashSet::new();
    for h in &headers {
        if !seen.insert(h.as_str()) {
            return Err(AnonError::Schema(format!("duplicate column `{}`", h)).into());
        }
    }

    let mut rows = Vec::new();
    for (idx, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("CSV parse error at record {}", idx))?;
        rows.push(record.iter().map(|c| c.trim().to_string()).collect());
    }
    debug!(columns = headers.len(), rows = rows.len(), "parsed CSV");

    Ok(RawTable { headers, rows })
}

/// Where raw respondent rows come from.
pub trait RecordSource {
    fn load(&mut self) -> Result<RawTable>;
}

/// A CSV file on disk.
pub struct CsvFile {
    path: PathBuf,
}

impl CsvFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSource for CsvFile {
    #[tracing::instrument(level = "info", skip(self), fields(path = %self.path.display()))]
    fn load(&mut self) -> Result<RawTable> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open input CSV: {:?}", self.path))?;
        let table = read_csv(BufReader::new(file))
            .with_context(|| format!("Failed to read input CSV: {:?}", self.path))?;
        info!(rows = table.len(), "loaded records");
        Ok(table)
    }
}

/// Rows already held in memory.
impl RecordSource for RawTable {
    fn load(&mut self) -> Result<RawTable> {
        Ok(self.clone())
    }
}
