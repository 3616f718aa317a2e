//! Error taxonomy shared by the request-side services and the pipeline.
use thiserror::Error;

use crate::model::SessionStatus;

pub use crate::auth::AuthError;
pub use crate::crm::CrmError;
pub use crate::extract::ParseError;
pub use crate::report::ReportError;

/// Malformed input rejected before any pipeline state is touched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),
    #[error("file is {size} bytes, limit is {limit}")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("file has {rows} rows, limit is {limit}")]
    TooManyRows { rows: usize, limit: usize },
    #[error("file contains no data rows")]
    EmptyFile,
    #[error("at least one key column is required")]
    NoKeyColumns,
    #[error("unknown key column: {0}")]
    UnknownKeyColumn(String),
    #[error("key column listed twice: {0}")]
    DuplicateKeyColumn(String),
    #[error("no columns left to update once key columns are excluded")]
    NoUpdatableColumns,
    #[error("entry {0} does not belong to this session")]
    UnknownEntry(i64),
    #[error("nothing selected for execution")]
    EmptySelection,
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced synchronously by the session service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("unreadable upload: {0}")]
    Parse(#[from] ParseError),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SessionStatus,
        actual: SessionStatus,
    },
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Failure that ends a matching or execution pass for the whole session.
#[derive(Debug, Error)]
pub enum PipelineAbort {
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}
