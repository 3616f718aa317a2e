//! Request-side operations: upload, review and the triggers that queue
//! background passes. Every operation passes the auth gate first.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, instrument};

use crate::auth::{AuthGate, Credentials};
use crate::config::Limits;
use crate::db::{self, EditOutcome, EntryEdit, NewSession, Pool, SessionSummary};
use crate::error::{ServiceError, ValidationError};
use crate::extract::TabularExtractor;
use crate::model::{EntryAction, PendingChange, SessionStatus, TargetKind, UploadSession};
use crate::report::{self, ReportKind};

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Clone)]
pub struct SessionService {
    pool: Pool,
    gate: AuthGate,
    extractor: Arc<dyn TabularExtractor>,
    limits: Limits,
}

impl SessionService {
    pub fn new(
        pool: Pool,
        gate: AuthGate,
        extractor: Arc<dyn TabularExtractor>,
        limits: Limits,
    ) -> Self {
        Self {
            pool,
            gate,
            extractor,
            limits,
        }
    }

    #[instrument(skip_all, fields(filename = %filename, size = bytes.len()))]
    pub async fn create_session(
        &self,
        creds: &Credentials,
        filename: &str,
        bytes: &[u8],
    ) -> ServiceResult<UploadSession> {
        self.gate.check(creds)?;
        if !self.extractor.supports(filename) {
            return Err(ValidationError::UnsupportedFileType(filename.to_string()).into());
        }
        let size = bytes.len() as u64;
        if size > self.limits.max_file_bytes {
            return Err(ValidationError::FileTooLarge {
                size,
                limit: self.limits.max_file_bytes,
            }
            .into());
        }

        let table = self.extractor.extract(bytes, filename)?;
        if table.rows.is_empty() {
            return Err(ValidationError::EmptyFile.into());
        }
        if table.rows.len() > self.limits.max_rows {
            return Err(ValidationError::TooManyRows {
                rows: table.rows.len(),
                limit: self.limits.max_rows,
            }
            .into());
        }

        let session = db::create_session(
            &self.pool,
            NewSession {
                file_name: filename.to_string(),
                file_size: size as i64,
                headers: table.headers,
                rows: table.rows,
            },
        )
        .await?;
        info!(session_id = %session.id, rows = session.row_count, "session created");
        Ok(session)
    }

    /// Confirm target kind and key columns; queues the matching pass.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn start_matching(
        &self,
        creds: &Credentials,
        session_id: &str,
        target: TargetKind,
        key_columns: &[String],
    ) -> ServiceResult<()> {
        self.gate.check(creds)?;
        let session = self.load(session_id).await?;
        expect_status(&session, SessionStatus::Uploaded)?;
        validate_key_columns(&session.headers, key_columns)?;

        if !db::begin_matching(&self.pool, session_id, target, key_columns).await? {
            return Err(self.state_conflict(session_id, SessionStatus::Uploaded).await);
        }
        info!(target = target.as_str(), keys = ?key_columns, "matching queued");
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn apply_edits(
        &self,
        creds: &Credentials,
        session_id: &str,
        edits: &[EntryEdit],
    ) -> ServiceResult<usize> {
        self.gate.check(creds)?;
        match db::apply_entry_edits(&self.pool, session_id, edits).await? {
            EditOutcome::Applied(n) => Ok(n),
            EditOutcome::UnknownEntry(id) => Err(ValidationError::UnknownEntry(id).into()),
            EditOutcome::WrongState(actual) => Err(ServiceError::InvalidState {
                expected: SessionStatus::Preview,
                actual,
            }),
            EditOutcome::MissingSession => Err(ServiceError::NotFound(session_id.to_string())),
        }
    }

    /// Select or deselect every matched entry at once.
    #[instrument(skip_all, fields(session_id = %session_id, selected = selected))]
    pub async fn select_all(
        &self,
        creds: &Credentials,
        session_id: &str,
        selected: bool,
    ) -> ServiceResult<u64> {
        self.gate.check(creds)?;
        let session = self.load(session_id).await?;
        expect_status(&session, SessionStatus::Preview)?;
        Ok(db::set_matched_selected(&self.pool, session_id, selected).await?)
    }

    /// Resolve what to run and queue the execution pass.
    ///
    /// Without `entry_ids`, runs every selected `update` entry that matched a
    /// record. An explicit subset overrides selection but still needs a match.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn start_execution(
        &self,
        creds: &Credentials,
        session_id: &str,
        entry_ids: Option<&[i64]>,
    ) -> ServiceResult<Vec<i64>> {
        self.gate.check(creds)?;
        let session = self.load(session_id).await?;
        expect_status(&session, SessionStatus::Preview)?;
        let entries = db::list_entries_by_session(&self.pool, session_id).await?;
        let resolved = resolve_execution_set(&entries, entry_ids)?;
        if resolved.is_empty() {
            return Err(ValidationError::EmptySelection.into());
        }

        if !db::begin_execution(&self.pool, session_id, &resolved).await? {
            return Err(self.state_conflict(session_id, SessionStatus::Preview).await);
        }
        info!(entries = resolved.len(), "execution queued");
        Ok(resolved)
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn start_undo(&self, creds: &Credentials, session_id: &str) -> ServiceResult<()> {
        self.gate.check(creds)?;
        let session = self.load(session_id).await?;
        expect_status(&session, SessionStatus::Completed)?;
        if !db::begin_undo(&self.pool, session_id).await? {
            return Err(
                ValidationError::Other("an undo pass is already queued".to_string()).into(),
            );
        }
        info!("undo queued");
        Ok(())
    }

    pub async fn status(
        &self,
        creds: &Credentials,
        session_id: &str,
    ) -> ServiceResult<SessionSummary> {
        self.gate.check(creds)?;
        db::session_summary(&self.pool, session_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(session_id.to_string()))
    }

    pub async fn entries(
        &self,
        creds: &Credentials,
        session_id: &str,
    ) -> ServiceResult<Vec<PendingChange>> {
        self.gate.check(creds)?;
        self.load(session_id).await?;
        Ok(db::list_entries_by_session(&self.pool, session_id).await?)
    }

    pub async fn report(
        &self,
        creds: &Credentials,
        session_id: &str,
        kind: ReportKind,
    ) -> ServiceResult<String> {
        self.gate.check(creds)?;
        self.load(session_id).await?;
        let entries = db::list_entries_by_session(&self.pool, session_id).await?;
        Ok(report::render(kind, &entries)?)
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn delete_session(&self, creds: &Credentials, session_id: &str) -> ServiceResult<()> {
        self.gate.check(creds)?;
        if !db::delete_session(&self.pool, session_id).await? {
            return Err(ServiceError::NotFound(session_id.to_string()));
        }
        info!("session deleted");
        Ok(())
    }

    /// Session metadata only; request paths never need the uploaded rows.
    async fn load(&self, session_id: &str) -> ServiceResult<UploadSession> {
        db::get_session_header(&self.pool, session_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(session_id.to_string()))
    }

    /// Error for a lost compare-and-set, reporting the status that won.
    async fn state_conflict(&self, session_id: &str, expected: SessionStatus) -> ServiceError {
        match db::session_status(&self.pool, session_id).await {
            Ok(Some(actual)) => ServiceError::InvalidState { expected, actual },
            Ok(None) => ServiceError::NotFound(session_id.to_string()),
            Err(err) => ServiceError::Storage(err),
        }
    }
}

fn expect_status(session: &UploadSession, expected: SessionStatus) -> ServiceResult<()> {
    if session.status != expected {
        return Err(ServiceError::InvalidState {
            expected,
            actual: session.status,
        });
    }
    Ok(())
}

pub fn validate_key_columns(headers: &[String], key_columns: &[String]) -> Result<(), ValidationError> {
    if key_columns.is_empty() {
        return Err(ValidationError::NoKeyColumns);
    }
    let mut seen = HashSet::new();
    for key in key_columns {
        if !headers.contains(key) {
            return Err(ValidationError::UnknownKeyColumn(key.clone()));
        }
        if !seen.insert(key) {
            return Err(ValidationError::DuplicateKeyColumn(key.clone()));
        }
    }
    if headers.iter().all(|h| key_columns.contains(h)) {
        return Err(ValidationError::NoUpdatableColumns);
    }
    Ok(())
}

/// Ids to execute: the explicit list in its given order, or the selected
/// entries in entry order.
pub fn resolve_execution_set(
    entries: &[PendingChange],
    explicit: Option<&[i64]>,
) -> Result<Vec<i64>, ValidationError> {
    match explicit {
        Some(ids) => {
            let by_id: HashMap<i64, &PendingChange> = entries.iter().map(|e| (e.id, e)).collect();
            let mut resolved = Vec::with_capacity(ids.len());
            let mut seen = HashSet::with_capacity(ids.len());
            for id in ids {
                let entry = by_id
                    .get(id)
                    .ok_or(ValidationError::UnknownEntry(*id))?;
                if entry.external_id.is_some() && seen.insert(*id) {
                    resolved.push(*id);
                }
            }
            Ok(resolved)
        }
        None => Ok(entries
            .iter()
            .filter(|e| e.selected && e.action == EntryAction::Update && e.external_id.is_some())
            .map(|e| e.id)
            .collect()),
    }
}
