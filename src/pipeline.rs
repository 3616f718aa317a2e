//! Background passes over a session: matching, execution and undo.
//!
//! Each pass owns the session's status transitions. Recoverable failures are
//! handled inside the passes; anything that escapes as [`PipelineAbort`] moves
//! the session to `error` with the message attached.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::crm::CrmService;
use crate::db::{self, Pool};
use crate::diff::build_entries;
use crate::error::PipelineAbort;
use crate::executor::{self, ExecutionReport};
use crate::matcher::{match_row, MatchOutcome};
use crate::model::{SessionStatus, UploadSession};
use crate::undo::{self, UndoReport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchReport {
    pub rows: usize,
    pub found: usize,
    pub duplicates: usize,
    pub not_found: usize,
}

#[derive(Clone)]
pub struct Pipeline {
    pool: Pool,
    crm: Arc<dyn CrmService>,
    batch_size: usize,
}

impl Pipeline {
    pub fn new(pool: Pool, crm: Arc<dyn CrmService>, batch_size: usize) -> Self {
        Self {
            pool,
            crm,
            batch_size,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// `processing -> preview`, or `processing -> error` if the loop aborts.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn run_matching(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<MatchReport>> {
        let Some(session) = self.session_in(session_id, SessionStatus::Processing).await? else {
            return Ok(None);
        };
        match self.match_all(&session, cancel).await {
            Ok(report) => {
                db::transition_session(
                    &self.pool,
                    session_id,
                    SessionStatus::Processing,
                    SessionStatus::Preview,
                    None,
                )
                .await?;
                info!(
                    rows = report.rows,
                    found = report.found,
                    duplicates = report.duplicates,
                    not_found = report.not_found,
                    "matching finished"
                );
                Ok(Some(report))
            }
            Err(abort) => {
                self.abort(session_id, SessionStatus::Processing, &abort).await?;
                Ok(None)
            }
        }
    }

    async fn match_all(
        &self,
        session: &UploadSession,
        cancel: &CancellationToken,
    ) -> Result<MatchReport, PipelineAbort> {
        let target = session
            .target
            .ok_or_else(|| anyhow::anyhow!("session has no target kind"))?;
        let mut report = MatchReport::default();

        for (idx, row) in session.rows.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineAbort::Cancelled);
            }
            let outcome = match_row(self.crm.as_ref(), row, &session.key_columns, target).await;
            match &outcome {
                MatchOutcome::Found { .. } => report.found += 1,
                MatchOutcome::Duplicate { .. } => report.duplicates += 1,
                MatchOutcome::NotFound { .. } => report.not_found += 1,
            }
            let entries = build_entries(idx, row, &session.key_columns, &outcome);
            db::insert_entries(&self.pool, &session.id, &entries).await?;
            report.rows += 1;
        }
        Ok(report)
    }

    /// `executing -> completed` once every batch was attempted.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn run_execution(
        &self,
        session_id: &str,
        entry_ids: &[i64],
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<ExecutionReport>> {
        if self
            .session_in(session_id, SessionStatus::Executing)
            .await?
            .is_none()
        {
            return Ok(None);
        }
        let result = executor::execute_entries(
            &self.pool,
            self.crm.as_ref(),
            session_id,
            entry_ids,
            self.batch_size,
            cancel,
        )
        .await;
        match result {
            Ok(report) => {
                db::transition_session(
                    &self.pool,
                    session_id,
                    SessionStatus::Executing,
                    SessionStatus::Completed,
                    None,
                )
                .await?;
                info!(
                    batches = report.batches,
                    failed_batches = report.failed_batches,
                    completed = report.completed_entries,
                    failed = report.failed_entries,
                    "execution finished"
                );
                Ok(Some(report))
            }
            Err(abort) => {
                self.abort(session_id, SessionStatus::Executing, &abort).await?;
                Ok(None)
            }
        }
    }

    /// Undo leaves the session `completed`; per-entry outcomes carry the result.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn run_undo(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<UndoReport>> {
        if self
            .session_in(session_id, SessionStatus::Completed)
            .await?
            .is_none()
        {
            return Ok(None);
        }
        match undo::undo_session(&self.pool, self.crm.as_ref(), session_id, cancel).await {
            Ok(report) => Ok(Some(report)),
            Err(PipelineAbort::Cancelled) => {
                warn!("undo cancelled");
                Ok(None)
            }
            Err(PipelineAbort::Unexpected(err)) => Err(err),
        }
    }

    async fn session_in(
        &self,
        session_id: &str,
        expected: SessionStatus,
    ) -> anyhow::Result<Option<UploadSession>> {
        match db::get_session(&self.pool, session_id).await? {
            Some(session) if session.status == expected => Ok(Some(session)),
            Some(session) => {
                warn!(
                    status = session.status.as_str(),
                    expected = expected.as_str(),
                    "session not in expected state; skipping"
                );
                Ok(None)
            }
            None => {
                warn!("session no longer exists; skipping");
                Ok(None)
            }
        }
    }

    async fn abort(
        &self,
        session_id: &str,
        from: SessionStatus,
        abort: &PipelineAbort,
    ) -> anyhow::Result<()> {
        let message = abort.to_string();
        error!(error = %message, from = from.as_str(), "pipeline aborted");
        db::transition_session(
            &self.pool,
            session_id,
            from,
            SessionStatus::Error,
            Some(&message),
        )
        .await?;
        Ok(())
    }
}
