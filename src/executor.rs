//! Applies confirmed pending changes to the CRM in fixed-size batches.
use std::collections::BTreeMap;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::crm::{CrmService, FieldValues, RecordUpdate};
use crate::db::{self, Pool};
use crate::error::PipelineAbort;
use crate::model::{BatchStatus, EntityKind, EntryStatus, PendingChange};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub batches: usize,
    pub failed_batches: usize,
    pub completed_entries: usize,
    pub failed_entries: usize,
}

/// Contiguous, order-preserving groups of at most `size` ids.
pub fn partition(ids: &[i64], size: usize) -> Vec<Vec<i64>> {
    ids.chunks(size.max(1)).map(|chunk| chunk.to_vec()).collect()
}

/// Run every batch for `entry_ids`, one batch at a time.
///
/// All batch records are written before the first one runs. A failed bulk
/// call marks that kind's entries in that batch as errored and the loop moves
/// on; only store failures or cancellation abort the pass.
#[instrument(skip_all, fields(session_id = %session_id, entries = entry_ids.len()))]
pub async fn execute_entries(
    pool: &Pool,
    crm: &dyn CrmService,
    session_id: &str,
    entry_ids: &[i64],
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<ExecutionReport, PipelineAbort> {
    let entries: BTreeMap<i64, PendingChange> = db::get_entries(pool, session_id, entry_ids)
        .await?
        .into_iter()
        .map(|e| (e.id, e))
        .collect();

    let runnable: Vec<i64> = entry_ids
        .iter()
        .copied()
        .filter(|id| match entries.get(id) {
            Some(e) if e.external_id.is_some() && e.entity_kind.is_some() => true,
            Some(_) => {
                warn!(entry_id = id, "entry has no matched record; skipping");
                false
            }
            None => {
                warn!(entry_id = id, "entry no longer exists; skipping");
                false
            }
        })
        .collect();

    let batches = db::create_batches(pool, session_id, &partition(&runnable, batch_size)).await?;
    let mut report = ExecutionReport {
        batches: batches.len(),
        ..Default::default()
    };

    for batch in &batches {
        if cancel.is_cancelled() {
            return Err(PipelineAbort::Cancelled);
        }
        db::update_batch(pool, batch.id, BatchStatus::Processing, &[], None).await?;

        let mut by_kind: BTreeMap<EntityKind, Vec<&PendingChange>> = BTreeMap::new();
        for id in &batch.entry_ids {
            if let Some(entry) = entries.get(id) {
                if let Some(kind) = entry.entity_kind {
                    by_kind.entry(kind).or_default().push(entry);
                }
            }
        }

        let mut errors = Vec::new();
        for (kind, group) in &by_kind {
            let ids: Vec<i64> = group.iter().map(|e| e.id).collect();
            match crm.bulk_update(*kind, &record_updates(group)).await {
                Ok(()) => {
                    db::mark_entries(pool, &ids, EntryStatus::Completed, None).await?;
                    report.completed_entries += ids.len();
                }
                Err(err) => {
                    let message = err.to_string();
                    warn!(batch = batch.sequence, kind = kind.as_str(), %err, "bulk update failed");
                    db::mark_entries(pool, &ids, EntryStatus::Error, Some(&message)).await?;
                    report.failed_entries += ids.len();
                    errors.push(format!("{}: {}", kind.as_str(), message));
                }
            }
        }

        let status = if errors.is_empty() {
            BatchStatus::Completed
        } else {
            report.failed_batches += 1;
            BatchStatus::Failed
        };
        db::update_batch(pool, batch.id, status, &errors, Some(Utc::now())).await?;
        info!(
            batch = batch.sequence,
            status = status.as_str(),
            entries = batch.entry_ids.len(),
            "batch attempted"
        );
    }

    Ok(report)
}

fn record_updates(group: &[&PendingChange]) -> Vec<RecordUpdate> {
    group
        .iter()
        .filter_map(|e| {
            let id = e.external_id.clone()?;
            let mut fields = FieldValues::new();
            fields.insert(e.field.clone(), e.new_value.clone());
            Some(RecordUpdate { id, fields })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_yields_ceil_n_over_size_contiguous_slices() {
        let ids: Vec<i64> = (0..123).collect();
        let groups = partition(&ids, 50);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], (0..50).collect::<Vec<_>>());
        assert_eq!(groups[1], (50..100).collect::<Vec<_>>());
        assert_eq!(groups[2], (100..123).collect::<Vec<_>>());
        assert_eq!(groups.concat(), ids);
    }

    #[test]
    fn partition_exact_multiple_and_empty() {
        let ids: Vec<i64> = (0..100).collect();
        assert_eq!(partition(&ids, 50).len(), 2);
        assert!(partition(&[], 50).is_empty());
    }
}
