//! Reverts applied changes by writing back the recorded current values.
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::crm::{CrmService, FieldValues};
use crate::db::{self, Pool};
use crate::error::PipelineAbort;
use crate::model::EntryStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UndoReport {
    pub reverted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Revert every applied entry of a session, one record update per entry.
///
/// Entries whose previous value was never recorded are left alone. A failed
/// revert marks the entry `undo_failed` and the pass continues; such entries
/// are retried by the next undo.
#[instrument(skip_all, fields(session_id = %session_id))]
pub async fn undo_session(
    pool: &Pool,
    crm: &dyn CrmService,
    session_id: &str,
    cancel: &CancellationToken,
) -> Result<UndoReport, PipelineAbort> {
    let entries = db::list_entries_by_status(
        pool,
        session_id,
        &[EntryStatus::Completed, EntryStatus::UndoFailed],
    )
    .await?;

    let mut report = UndoReport::default();
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(PipelineAbort::Cancelled);
        }
        let (Some(id), Some(kind), Some(previous)) = (
            entry.external_id.as_deref(),
            entry.entity_kind,
            entry.current_value.as_deref(),
        ) else {
            report.skipped += 1;
            continue;
        };

        let mut fields = FieldValues::new();
        fields.insert(entry.field.clone(), previous.to_string());
        match crm.update(kind, id, &fields).await {
            Ok(()) => {
                db::mark_entry_reverted(pool, entry.id, previous).await?;
                report.reverted += 1;
            }
            Err(err) => {
                warn!(entry_id = entry.id, field = %entry.field, %err, "undo failed");
                let message = err.to_string();
                db::mark_entries(pool, &[entry.id], EntryStatus::UndoFailed, Some(&message))
                    .await?;
                report.failed += 1;
            }
        }
    }

    info!(
        reverted = report.reverted,
        skipped = report.skipped,
        failed = report.failed,
        "undo pass finished"
    );
    Ok(report)
}
