//! Insert payloads and view models used by repositories.
//!
//! Keep these structs focused on the data crossing the SQL boundary. Business
//! logic should live in higher layers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{
    EntityKind, EntryAction, EntryStatus, ExecutionBatch, Row, SessionStatus, UploadSession,
};

/// Session as first persisted after a successful upload.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub file_name: String,
    pub file_size: i64,
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

/// Pending change produced by the diff builder, before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub row_index: i64,
    pub search_key: String,
    pub external_id: Option<String>,
    pub entity_kind: Option<EntityKind>,
    pub field: String,
    pub current_value: Option<String>,
    pub new_value: String,
    pub action: EntryAction,
    pub status: EntryStatus,
    pub selected: bool,
}

/// User review edit for one entry; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryEdit {
    pub id: i64,
    #[serde(default)]
    pub action: Option<EntryAction>,
    #[serde(default)]
    pub new_value: Option<String>,
    #[serde(default)]
    pub selected: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Applied(usize),
    UnknownEntry(i64),
    WrongState(SessionStatus),
    MissingSession,
}

/// Polling view of a session: metadata, entry tallies, batches and queued jobs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: UploadSession,
    pub entry_counts: BTreeMap<String, i64>,
    pub batches: Vec<ExecutionBatch>,
    pub queued_jobs: i64,
}
