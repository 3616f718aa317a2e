use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::db;
use crate::model::JobKind;
use crate::pipeline::Pipeline;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Claim and run the oldest queued job. Returns false when the queue is empty.
#[instrument(skip_all)]
pub async fn process_next_job(pipeline: &Pipeline, cancel: &CancellationToken) -> Result<bool> {
    let Some(job) = db::claim_next_job(pipeline.pool()).await? else {
        return Ok(false);
    };
    info!(id = job.id, kind = job.kind.as_str(), session_id = %job.session_id, "job claimed");
    match job.kind {
        JobKind::Match => {
            pipeline.run_matching(&job.session_id, cancel).await?;
        }
        JobKind::Execute => {
            pipeline
                .run_execution(&job.session_id, &job.entry_ids, cancel)
                .await?;
        }
        JobKind::Undo => {
            pipeline.run_undo(&job.session_id, cancel).await?;
        }
    }
    Ok(true)
}

/// Poll the queue until `cancel` fires.
pub async fn run_worker(pipeline: Pipeline, poll_interval: Duration, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        match process_next_job(&pipeline, &cancel).await {
            Ok(true) => {}
            Ok(false) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(err) => {
                error!(?err, "job worker error");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
    info!("job worker stopped");
}

/// Run queued jobs until none are left; returns how many ran.
pub async fn drain(pipeline: &Pipeline, cancel: &CancellationToken) -> Result<usize> {
    let mut processed = 0;
    while !cancel.is_cancelled() && process_next_job(pipeline, cancel).await? {
        processed += 1;
    }
    Ok(processed)
}
