use super::model::{EditOutcome, EntryEdit, NewEntry, NewSession, SessionSummary};
use crate::model::{
    BatchStatus, EntityKind, EntryAction, EntryStatus, ExecutionBatch, Job, JobKind,
    PendingChange, SessionStatus, TargetKind, UploadSession,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

const SESSION_HEADER_COLUMNS: &str = "id, file_name, file_size, row_count, target, key_columns, \
     headers, status, error, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, session_id, row_index, search_key, external_id, entity_kind, \
     field, current_value, new_value, action, status, error, selected";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask sqlx to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{}&mode=rwc", q),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{}?{}", expanded_path, query)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(file_name = %new.file_name))]
pub async fn create_session(pool: &Pool, new: NewSession) -> Result<UploadSession> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let headers = serde_json::to_string(&new.headers)?;
    let rows = serde_json::to_string(&new.rows)?;
    sqlx::query(
        "INSERT INTO sessions (id, file_name, file_size, row_count, key_columns, headers, rows, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, '[]', ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&new.file_name)
    .bind(new.file_size)
    .bind(new.rows.len() as i64)
    .bind(headers)
    .bind(rows)
    .bind(SessionStatus::Uploaded.as_str())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to insert session")?;

    Ok(UploadSession {
        id,
        file_name: new.file_name,
        file_size: new.file_size,
        row_count: new.rows.len() as i64,
        target: None,
        key_columns: Vec::new(),
        headers: new.headers,
        rows: new.rows,
        status: SessionStatus::Uploaded,
        error: None,
        created_at: now,
        updated_at: now,
    })
}

#[instrument(skip_all)]
pub async fn get_session(pool: &Pool, session_id: &str) -> Result<Option<UploadSession>> {
    let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| session_from_row(&r, true)).transpose()
}

/// Session without its uploaded rows; `rows` comes back empty.
#[instrument(skip_all)]
pub async fn get_session_header(pool: &Pool, session_id: &str) -> Result<Option<UploadSession>> {
    let sql = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_HEADER_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| session_from_row(&r, false)).transpose()
}

#[instrument(skip_all)]
pub async fn session_status(pool: &Pool, session_id: &str) -> Result<Option<SessionStatus>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM sessions WHERE id = ?")
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
    status
        .map(|s| SessionStatus::parse_state(&s).ok_or_else(|| anyhow!("unknown session status {}", s)))
        .transpose()
}

/// Compare-and-set status change. Returns false when the session was not in `from`.
#[instrument(skip_all, fields(session_id = %session_id, from = from.as_str(), to = to.as_str()))]
pub async fn transition_session(
    pool: &Pool,
    session_id: &str,
    from: SessionStatus,
    to: SessionStatus,
    error: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE sessions SET status = ?, error = COALESCE(?, error), updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(error)
    .bind(Utc::now())
    .bind(session_id)
    .bind(from.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Record target and key columns, move `uploaded -> processing` and queue the
/// matching job, all in one transaction.
#[instrument(skip_all, fields(session_id = %session_id))]
pub async fn begin_matching(
    pool: &Pool,
    session_id: &str,
    target: TargetKind,
    key_columns: &[String],
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE sessions SET target = ?, key_columns = ?, status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(target.as_str())
    .bind(serde_json::to_string(key_columns)?)
    .bind(SessionStatus::Processing.as_str())
    .bind(Utc::now())
    .bind(session_id)
    .bind(SessionStatus::Uploaded.as_str())
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() != 1 {
        return Ok(false);
    }
    enqueue_job_tx(&mut tx, session_id, JobKind::Match, &[]).await?;
    tx.commit().await?;
    Ok(true)
}

/// Move `preview -> executing` and queue the execution job for `entry_ids`.
#[instrument(skip_all, fields(session_id = %session_id, entries = entry_ids.len()))]
pub async fn begin_execution(pool: &Pool, session_id: &str, entry_ids: &[i64]) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE sessions SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(SessionStatus::Executing.as_str())
    .bind(Utc::now())
    .bind(session_id)
    .bind(SessionStatus::Preview.as_str())
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() != 1 {
        return Ok(false);
    }
    enqueue_job_tx(&mut tx, session_id, JobKind::Execute, entry_ids).await?;
    tx.commit().await?;
    Ok(true)
}

/// Queue an undo pass; only a `completed` session without a pending undo qualifies.
#[instrument(skip_all, fields(session_id = %session_id))]
pub async fn begin_undo(pool: &Pool, session_id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM sessions WHERE id = ?")
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;
    if status.as_deref() != Some(SessionStatus::Completed.as_str()) {
        return Ok(false);
    }
    let pending: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE session_id = ? AND kind = ?")
            .bind(session_id)
            .bind(JobKind::Undo.as_str())
            .fetch_one(&mut *tx)
            .await?;
    if pending > 0 {
        return Ok(false);
    }
    enqueue_job_tx(&mut tx, session_id, JobKind::Undo, &[]).await?;
    tx.commit().await?;
    Ok(true)
}

#[instrument(skip_all)]
pub async fn delete_session(pool: &Pool, session_id: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn session_summary(pool: &Pool, session_id: &str) -> Result<Option<SessionSummary>> {
    let Some(session) = get_session_header(pool, session_id).await? else {
        return Ok(None);
    };
    let counts: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM entries WHERE session_id = ? GROUP BY status",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    let batches = list_batches_by_session(pool, session_id).await?;
    let queued_jobs = count_queued_jobs(pool, session_id).await?;
    Ok(Some(SessionSummary {
        session,
        entry_counts: counts.into_iter().collect::<BTreeMap<_, _>>(),
        batches,
        queued_jobs,
    }))
}

// ---------------------------------------------------------------------------
// Pending change entries
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(session_id = %session_id, count = entries.len()))]
pub async fn insert_entries(pool: &Pool, session_id: &str, entries: &[NewEntry]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for e in entries {
        sqlx::query(
            "INSERT INTO entries (session_id, row_index, search_key, external_id, entity_kind, field, current_value, new_value, action, status, selected) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(e.row_index)
        .bind(&e.search_key)
        .bind(&e.external_id)
        .bind(e.entity_kind.map(|k| k.as_str()))
        .bind(&e.field)
        .bind(&e.current_value)
        .bind(&e.new_value)
        .bind(e.action.as_str())
        .bind(e.status.as_str())
        .bind(e.selected)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_entries_by_session(pool: &Pool, session_id: &str) -> Result<Vec<PendingChange>> {
    let sql = format!(
        "SELECT {} FROM entries WHERE session_id = ? ORDER BY row_index, id",
        ENTRY_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(session_id).fetch_all(pool).await?;
    rows.iter().map(entry_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_entries_by_status(
    pool: &Pool,
    session_id: &str,
    statuses: &[EntryStatus],
) -> Result<Vec<PendingChange>> {
    let wanted: HashSet<EntryStatus> = statuses.iter().copied().collect();
    Ok(list_entries_by_session(pool, session_id)
        .await?
        .into_iter()
        .filter(|e| wanted.contains(&e.status))
        .collect())
}

/// Entries of `session_id` with the given ids, in the order of `ids`.
#[instrument(skip_all, fields(session_id = %session_id, count = ids.len()))]
pub async fn get_entries(pool: &Pool, session_id: &str, ids: &[i64]) -> Result<Vec<PendingChange>> {
    let mut by_id: BTreeMap<i64, PendingChange> = list_entries_by_session(pool, session_id)
        .await?
        .into_iter()
        .map(|e| (e.id, e))
        .collect();
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

/// Apply review edits atomically while the session is in `preview`.
#[instrument(skip_all, fields(session_id = %session_id, edits = edits.len()))]
pub async fn apply_entry_edits(
    pool: &Pool,
    session_id: &str,
    edits: &[EntryEdit],
) -> Result<EditOutcome> {
    let mut tx = pool.begin().await?;
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM sessions WHERE id = ?")
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(status) = status else {
        return Ok(EditOutcome::MissingSession);
    };
    let status = SessionStatus::parse_state(&status)
        .ok_or_else(|| anyhow!("unknown session status {}", status))?;
    if status != SessionStatus::Preview {
        return Ok(EditOutcome::WrongState(status));
    }

    for edit in edits {
        let res = sqlx::query(
            "UPDATE entries SET action = COALESCE(?, action), new_value = COALESCE(?, new_value), selected = COALESCE(?, selected) \
             WHERE id = ? AND session_id = ?",
        )
        .bind(edit.action.map(|a| a.as_str()))
        .bind(&edit.new_value)
        .bind(edit.selected)
        .bind(edit.id)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() != 1 {
            // dropping the transaction rolls back earlier edits
            return Ok(EditOutcome::UnknownEntry(edit.id));
        }
    }
    tx.commit().await?;
    Ok(EditOutcome::Applied(edits.len()))
}

/// Toggle `selected` on every matched (found/duplicate) entry of a session in preview.
#[instrument(skip_all, fields(session_id = %session_id, selected = selected))]
pub async fn set_matched_selected(pool: &Pool, session_id: &str, selected: bool) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE entries SET selected = ? \
         WHERE session_id = ? AND status IN (?, ?) \
           AND EXISTS (SELECT 1 FROM sessions s WHERE s.id = entries.session_id AND s.status = ?)",
    )
    .bind(selected)
    .bind(session_id)
    .bind(EntryStatus::Found.as_str())
    .bind(EntryStatus::Duplicate.as_str())
    .bind(SessionStatus::Preview.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all, fields(count = entry_ids.len(), status = status.as_str()))]
pub async fn mark_entries(
    pool: &Pool,
    entry_ids: &[i64],
    status: EntryStatus,
    error: Option<&str>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    for id in entry_ids {
        sqlx::query("UPDATE entries SET status = ?, error = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(*id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Record a successful rollback: the entry shows the restored value again.
#[instrument(skip_all, fields(entry_id = entry_id))]
pub async fn mark_entry_reverted(pool: &Pool, entry_id: i64, restored: &str) -> Result<()> {
    sqlx::query("UPDATE entries SET status = ?, new_value = ?, error = NULL WHERE id = ?")
        .bind(EntryStatus::Found.as_str())
        .bind(restored)
        .bind(entry_id)
        .execute(pool)
        .await
        .context("failed to persist reverted entry")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Execution batches
// ---------------------------------------------------------------------------

/// Persist every batch (status `pending`) before any of them runs.
#[instrument(skip_all, fields(session_id = %session_id, batches = groups.len()))]
pub async fn create_batches(
    pool: &Pool,
    session_id: &str,
    groups: &[Vec<i64>],
) -> Result<Vec<ExecutionBatch>> {
    let mut tx = pool.begin().await?;
    let mut created = Vec::with_capacity(groups.len());
    for (seq, ids) in groups.iter().enumerate() {
        let id: i64 = sqlx::query(
            "INSERT INTO batches (session_id, sequence, entry_ids, status, errors) VALUES (?, ?, ?, ?, '[]') RETURNING id",
        )
        .bind(session_id)
        .bind(seq as i64)
        .bind(serde_json::to_string(ids)?)
        .bind(BatchStatus::Pending.as_str())
        .fetch_one(&mut *tx)
        .await?
        .get("id");
        created.push(ExecutionBatch {
            id,
            session_id: session_id.to_string(),
            sequence: seq as i64,
            entry_ids: ids.clone(),
            status: BatchStatus::Pending,
            completed_at: None,
            errors: Vec::new(),
        });
    }
    tx.commit().await?;
    Ok(created)
}

#[instrument(skip_all, fields(batch_id = batch_id, status = status.as_str()))]
pub async fn update_batch(
    pool: &Pool,
    batch_id: i64,
    status: BatchStatus,
    errors: &[String],
    completed_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query("UPDATE batches SET status = ?, errors = ?, completed_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(serde_json::to_string(errors)?)
        .bind(completed_at)
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_batches_by_session(pool: &Pool, session_id: &str) -> Result<Vec<ExecutionBatch>> {
    let rows = sqlx::query(
        "SELECT id, session_id, sequence, entry_ids, status, completed_at, errors FROM batches WHERE session_id = ? ORDER BY sequence",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(batch_from_row).collect()
}

// ---------------------------------------------------------------------------
// Job queue
// ---------------------------------------------------------------------------

async fn enqueue_job_tx(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: &str,
    kind: JobKind,
    entry_ids: &[i64],
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO jobs (session_id, kind, payload, created_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(session_id)
    .bind(kind.as_str())
    .bind(serde_json::to_string(entry_ids)?)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

/// Remove and return the oldest queued job. A claimed job is never retried.
#[instrument(skip_all)]
pub async fn claim_next_job(pool: &Pool) -> Result<Option<Job>> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query(
        "DELETE FROM jobs WHERE id = (SELECT id FROM jobs ORDER BY id ASC LIMIT 1) \
         RETURNING id, session_id, kind, payload",
    )
    .fetch_optional(&mut *tx)
    .await?;
    let job = match row {
        Some(row) => {
            let kind: String = row.get("kind");
            let payload: String = row.get("payload");
            Some(Job {
                id: row.get("id"),
                session_id: row.get("session_id"),
                kind: JobKind::parse_state(&kind)
                    .ok_or_else(|| anyhow!("unknown job kind {}", kind))?,
                entry_ids: serde_json::from_str(&payload).context("invalid job payload")?,
            })
        }
        None => None,
    };
    tx.commit().await?;
    Ok(job)
}

/// Jobs still waiting for a worker for one session.
#[instrument(skip_all)]
pub async fn count_queued_jobs(pool: &Pool, session_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE session_id = ?")
        .bind(session_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn session_from_row(row: &SqliteRow, with_rows: bool) -> Result<UploadSession> {
    let status: String = row.get("status");
    let target: Option<String> = row.get("target");
    let key_columns: String = row.get("key_columns");
    let headers: String = row.get("headers");
    let rows = if with_rows {
        let raw: String = row.get("rows");
        serde_json::from_str(&raw).context("invalid rows")?
    } else {
        Vec::new()
    };
    Ok(UploadSession {
        id: row.get("id"),
        file_name: row.get("file_name"),
        file_size: row.get("file_size"),
        row_count: row.get("row_count"),
        target: target.as_deref().and_then(TargetKind::parse_state),
        key_columns: serde_json::from_str(&key_columns).context("invalid key_columns")?,
        headers: serde_json::from_str(&headers).context("invalid headers")?,
        rows,
        status: SessionStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("unknown session status {}", status))?,
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<PendingChange> {
    let action: String = row.get("action");
    let status: String = row.get("status");
    let kind: Option<String> = row.get("entity_kind");
    Ok(PendingChange {
        id: row.get("id"),
        session_id: row.get("session_id"),
        row_index: row.get("row_index"),
        search_key: row.get("search_key"),
        external_id: row.get("external_id"),
        entity_kind: kind.as_deref().and_then(EntityKind::parse_state),
        field: row.get("field"),
        current_value: row.get("current_value"),
        new_value: row.get("new_value"),
        action: EntryAction::parse_state(&action)
            .ok_or_else(|| anyhow!("unknown entry action {}", action))?,
        status: EntryStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("unknown entry status {}", status))?,
        error: row.get("error"),
        selected: row.get("selected"),
    })
}

fn batch_from_row(row: &SqliteRow) -> Result<ExecutionBatch> {
    let status: String = row.get("status");
    let entry_ids: String = row.get("entry_ids");
    let errors: String = row.get("errors");
    Ok(ExecutionBatch {
        id: row.get("id"),
        session_id: row.get("session_id"),
        sequence: row.get("sequence"),
        entry_ids: serde_json::from_str(&entry_ids).context("invalid batch entry_ids")?,
        status: BatchStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("unknown batch status {}", status))?,
        completed_at: row.get("completed_at"),
        errors: serde_json::from_str(&errors).context("invalid batch errors")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Row;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn new_session(pool: &Pool) -> UploadSession {
        create_session(
            pool,
            NewSession {
                file_name: "people.csv".into(),
                file_size: 42,
                headers: vec!["EMAIL".into(), "NAME".into()],
                rows: vec![row(&[("EMAIL", "a@x.io"), ("NAME", "Ann")])],
            },
        )
        .await
        .unwrap()
    }

    async fn get_entry(pool: &Pool, entry_id: i64) -> PendingChange {
        let sql = format!("SELECT {} FROM entries WHERE id = ?", ENTRY_COLUMNS);
        let row = sqlx::query(&sql).bind(entry_id).fetch_one(pool).await.unwrap();
        entry_from_row(&row).unwrap()
    }

    fn entry(row_index: i64, field: &str, status: EntryStatus) -> NewEntry {
        NewEntry {
            row_index,
            search_key: "EMAIL=a@x.io".into(),
            external_id: Some("1".into()),
            entity_kind: Some(EntityKind::Contact),
            field: field.into(),
            current_value: Some("Old".into()),
            new_value: "New".into(),
            action: EntryAction::Update,
            status,
            selected: true,
        }
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested/bulk.db");
        let url = format!("sqlite://{}", path.display());
        assert_eq!(
            prepare_sqlite_url(&url),
            format!("sqlite://{}?mode=rwc", path.display())
        );
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn session_round_trip_keeps_row_order() {
        let pool = setup_pool().await;
        let s = new_session(&pool).await;
        let loaded = get_session(&pool, &s.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Uploaded);
        assert_eq!(loaded.row_count, 1);
        let cols: Vec<&String> = loaded.rows[0].keys().collect();
        assert_eq!(cols, vec!["EMAIL", "NAME"]);
        assert!(get_session(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn summary_reads_session_without_rows() {
        let pool = setup_pool().await;
        let s = new_session(&pool).await;
        begin_matching(&pool, &s.id, TargetKind::Contacts, &["EMAIL".into()])
            .await
            .unwrap();

        let header = get_session_header(&pool, &s.id).await.unwrap().unwrap();
        assert!(header.rows.is_empty());
        assert_eq!(header.headers, vec!["EMAIL", "NAME"]);
        assert_eq!(header.row_count, 1);

        let summary = session_summary(&pool, &s.id).await.unwrap().unwrap();
        assert!(summary.session.rows.is_empty());
        assert_eq!(summary.session.status, SessionStatus::Processing);
        assert_eq!(summary.queued_jobs, 1);
    }

    #[tokio::test]
    async fn transitions_are_compare_and_set() {
        let pool = setup_pool().await;
        let s = new_session(&pool).await;

        assert!(!transition_session(&pool, &s.id, SessionStatus::Preview, SessionStatus::Executing, None)
            .await
            .unwrap());
        assert!(begin_matching(&pool, &s.id, TargetKind::Contacts, &["EMAIL".into()])
            .await
            .unwrap());
        // second confirmation loses the race
        assert!(!begin_matching(&pool, &s.id, TargetKind::Contacts, &["EMAIL".into()])
            .await
            .unwrap());
        assert_eq!(count_queued_jobs(&pool, &s.id).await.unwrap(), 1);

        let loaded = get_session(&pool, &s.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Processing);
        assert_eq!(loaded.target, Some(TargetKind::Contacts));
        assert_eq!(loaded.key_columns, vec!["EMAIL"]);

        let job = claim_next_job(&pool).await.unwrap().unwrap();
        assert_eq!(job.kind, JobKind::Match);
        assert!(claim_next_job(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn edits_are_all_or_nothing() {
        let pool = setup_pool().await;
        let s = new_session(&pool).await;
        insert_entries(&pool, &s.id, &[entry(0, "NAME", EntryStatus::Found)])
            .await
            .unwrap();
        let e = list_entries_by_session(&pool, &s.id).await.unwrap().remove(0);

        let edit = EntryEdit {
            id: e.id,
            new_value: Some("Edited".into()),
            ..Default::default()
        };
        assert_eq!(
            apply_entry_edits(&pool, &s.id, &[edit.clone()]).await.unwrap(),
            EditOutcome::WrongState(SessionStatus::Uploaded)
        );

        sqlx::query("UPDATE sessions SET status = 'preview' WHERE id = ?")
            .bind(&s.id)
            .execute(&pool)
            .await
            .unwrap();
        let bogus = EntryEdit {
            id: 9999,
            selected: Some(false),
            ..Default::default()
        };
        assert_eq!(
            apply_entry_edits(&pool, &s.id, &[edit.clone(), bogus]).await.unwrap(),
            EditOutcome::UnknownEntry(9999)
        );
        assert_eq!(get_entry(&pool, e.id).await.new_value, "New");

        assert_eq!(
            apply_entry_edits(&pool, &s.id, &[edit]).await.unwrap(),
            EditOutcome::Applied(1)
        );
        let updated = get_entry(&pool, e.id).await;
        assert_eq!(updated.new_value, "Edited");
        assert_eq!(updated.action, EntryAction::Update);
        assert!(updated.selected);
    }

    #[tokio::test]
    async fn delete_cascades_to_children() {
        let pool = setup_pool().await;
        let s = new_session(&pool).await;
        insert_entries(&pool, &s.id, &[entry(0, "NAME", EntryStatus::Found)])
            .await
            .unwrap();
        let ids: Vec<i64> = list_entries_by_session(&pool, &s.id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        create_batches(&pool, &s.id, &[ids]).await.unwrap();
        let mut tx = pool.begin().await.unwrap();
        enqueue_job_tx(&mut tx, &s.id, JobKind::Undo, &[]).await.unwrap();
        tx.commit().await.unwrap();

        assert!(delete_session(&pool, &s.id).await.unwrap());
        assert!(list_entries_by_session(&pool, &s.id).await.unwrap().is_empty());
        assert!(list_batches_by_session(&pool, &s.id).await.unwrap().is_empty());
        assert_eq!(count_queued_jobs(&pool, &s.id).await.unwrap(), 0);
        assert!(!delete_session(&pool, &s.id).await.unwrap());
    }

    #[tokio::test]
    async fn batch_updates_persist_errors() {
        let pool = setup_pool().await;
        let s = new_session(&pool).await;
        let created = create_batches(&pool, &s.id, &[vec![1, 2], vec![3]]).await.unwrap();
        assert_eq!(created.len(), 2);
        update_batch(
            &pool,
            created[1].id,
            BatchStatus::Failed,
            &["contact: boom".into()],
            Some(Utc::now()),
        )
        .await
        .unwrap();
        let batches = list_batches_by_session(&pool, &s.id).await.unwrap();
        assert_eq!(batches[0].status, BatchStatus::Pending);
        assert_eq!(batches[0].entry_ids, vec![1, 2]);
        assert_eq!(batches[1].status, BatchStatus::Failed);
        assert_eq!(batches[1].errors, vec!["contact: boom"]);
        assert!(batches[1].completed_at.is_some());
    }
}
