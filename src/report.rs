//! CSV export of problem entries for a session.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{EntryStatus, PendingChange};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    NotFound,
    Duplicates,
    Errors,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::NotFound => "not_found",
            ReportKind::Duplicates => "duplicates",
            ReportKind::Errors => "errors",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "not_found" | "not-found" => Some(ReportKind::NotFound),
            "duplicates" => Some(ReportKind::Duplicates),
            "errors" => Some(ReportKind::Errors),
            _ => None,
        }
    }

    fn includes(&self, status: EntryStatus) -> bool {
        match self {
            ReportKind::NotFound => status == EntryStatus::NotFound,
            ReportKind::Duplicates => status == EntryStatus::Duplicate,
            ReportKind::Errors => {
                matches!(status, EntryStatus::Error | EntryStatus::UndoFailed)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no {0} entries to report")]
    NotAvailable(&'static str),
    #[error("failed to write report: {0}")]
    Csv(#[from] csv::Error),
    #[error("report is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

const HEADER: [&str; 8] = [
    "row_index",
    "search_key",
    "external_id",
    "field",
    "current_value",
    "new_value",
    "status",
    "error",
];

/// Render the entries of `kind` as CSV, or `NotAvailable` if there are none.
pub fn render(kind: ReportKind, entries: &[PendingChange]) -> Result<String, ReportError> {
    let selected: Vec<&PendingChange> = entries.iter().filter(|e| kind.includes(e.status)).collect();
    if selected.is_empty() {
        return Err(ReportError::NotAvailable(kind.as_str()));
    }

    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(HEADER)?;
    for e in selected {
        // rows are reported 1-based to line up with the spreadsheet
        let row_number = (e.row_index + 1).to_string();
        wtr.write_record([
            row_number.as_str(),
            e.search_key.as_str(),
            e.external_id.as_deref().unwrap_or(""),
            e.field.as_str(),
            e.current_value.as_deref().unwrap_or(""),
            e.new_value.as_str(),
            e.status.as_str(),
            e.error.as_deref().unwrap_or(""),
        ])?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(String::from_utf8(bytes)?)
}
