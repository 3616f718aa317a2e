//! Tabular data extraction from uploaded files.
use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;

use crate::model::Row;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unsupported file type: {0}")]
    UnsupportedFormat(String),
    #[error("file has no header row")]
    MissingHeader,
    #[error("header {0} is empty")]
    EmptyHeader(usize),
    #[error("header {0:?} appears more than once")]
    DuplicateHeader(String),
    #[error("malformed record at line {line}: {message}")]
    Malformed { line: u64, message: String },
}

/// Ordered rows plus the header order they were read with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

pub trait TabularExtractor: Send + Sync {
    /// Whether this extractor understands `filename`.
    fn supports(&self, filename: &str) -> bool;

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<Table, ParseError>;
}

/// Delimited text extractor: `.csv` is comma separated, `.tsv`/`.txt` tab separated.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvExtractor;

impl CsvExtractor {
    fn delimiter_for(filename: &str) -> Option<u8> {
        match extension(filename).as_deref() {
            Some("csv") => Some(b','),
            Some("tsv") | Some("txt") => Some(b'\t'),
            _ => None,
        }
    }
}

impl TabularExtractor for CsvExtractor {
    fn supports(&self, filename: &str) -> bool {
        Self::delimiter_for(filename).is_some()
    }

    fn extract(&self, bytes: &[u8], filename: &str) -> Result<Table, ParseError> {
        let delimiter = Self::delimiter_for(filename)
            .ok_or_else(|| ParseError::UnsupportedFormat(filename.to_string()))?;
        // Strip a UTF-8 BOM so the first header matches what users typed.
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .has_headers(true)
            .from_reader(bytes);

        let raw_headers = reader.headers().map_err(malformed)?.clone();
        if raw_headers.is_empty() {
            return Err(ParseError::MissingHeader);
        }
        let mut headers = Vec::with_capacity(raw_headers.len());
        let mut seen = HashSet::new();
        for (idx, h) in raw_headers.iter().enumerate() {
            let name = h.trim().to_string();
            if name.is_empty() {
                return Err(ParseError::EmptyHeader(idx));
            }
            if !seen.insert(name.clone()) {
                return Err(ParseError::DuplicateHeader(name));
            }
            headers.push(name);
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(malformed)?;
            if record.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }
            let row: Row = headers
                .iter()
                .enumerate()
                .map(|(idx, name)| {
                    let value = record.get(idx).unwrap_or("").trim().to_string();
                    (name.clone(), value)
                })
                .collect();
            rows.push(row);
        }

        Ok(Table { headers, rows })
    }
}

pub(crate) fn extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
}

fn malformed(err: csv::Error) -> ParseError {
    let line = err.position().map(|p| p.line()).unwrap_or(0);
    ParseError::Malformed {
        line,
        message: err.to_string(),
    }
}
