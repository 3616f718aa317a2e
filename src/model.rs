use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One extracted input row, column header -> cell value, in file order.
pub type Row = IndexMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uploaded,
    Processing,
    Preview,
    Executing,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uploaded => "uploaded",
            SessionStatus::Processing => "processing",
            SessionStatus::Preview => "preview",
            SessionStatus::Executing => "executing",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(SessionStatus::Uploaded),
            "processing" => Some(SessionStatus::Processing),
            "preview" => Some(SessionStatus::Preview),
            "executing" => Some(SessionStatus::Executing),
            "completed" => Some(SessionStatus::Completed),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

/// Which CRM collections a session searches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Contacts,
    Companies,
    Both,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Contacts => "contacts",
            TargetKind::Companies => "companies",
            TargetKind::Both => "both",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "contacts" => Some(TargetKind::Contacts),
            "companies" => Some(TargetKind::Companies),
            "both" => Some(TargetKind::Both),
            _ => None,
        }
    }

    /// Entity kinds searched for this target, in search order.
    pub fn entity_kinds(&self) -> &'static [EntityKind] {
        match self {
            TargetKind::Contacts => &[EntityKind::Contact],
            TargetKind::Companies => &[EntityKind::Company],
            TargetKind::Both => &[EntityKind::Contact, EntityKind::Company],
        }
    }
}

/// A single CRM record category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Contact,
    Company,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Contact => "contact",
            EntityKind::Company => "company",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "contact" => Some(EntityKind::Contact),
            "company" => Some(EntityKind::Company),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryAction {
    Update,
    Ignore,
}

impl EntryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryAction::Update => "update",
            EntryAction::Ignore => "ignore",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "update" => Some(EntryAction::Update),
            "ignore" => Some(EntryAction::Ignore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Found,
    Duplicate,
    NotFound,
    Completed,
    Error,
    UndoFailed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Found => "found",
            EntryStatus::Duplicate => "duplicate",
            EntryStatus::NotFound => "not_found",
            EntryStatus::Completed => "completed",
            EntryStatus::Error => "error",
            EntryStatus::UndoFailed => "undo_failed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "found" => Some(EntryStatus::Found),
            "duplicate" => Some(EntryStatus::Duplicate),
            "not_found" => Some(EntryStatus::NotFound),
            "completed" => Some(EntryStatus::Completed),
            "error" => Some(EntryStatus::Error),
            "undo_failed" => Some(EntryStatus::UndoFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BatchStatus::Pending),
            "processing" => Some(BatchStatus::Processing),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Match,
    Execute,
    Undo,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Match => "match",
            JobKind::Execute => "execute",
            JobKind::Undo => "undo",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "match" => Some(JobKind::Match),
            "execute" => Some(JobKind::Execute),
            "undo" => Some(JobKind::Undo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub file_name: String,
    pub file_size: i64,
    pub row_count: i64,
    pub target: Option<TargetKind>,
    pub key_columns: Vec<String>,
    pub headers: Vec<String>,
    #[serde(skip_serializing)]
    pub rows: Vec<Row>,
    pub status: SessionStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One proposed field update for one input row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingChange {
    pub id: i64,
    pub session_id: String,
    pub row_index: i64,
    pub search_key: String,
    pub external_id: Option<String>,
    pub entity_kind: Option<EntityKind>,
    pub field: String,
    pub current_value: Option<String>,
    pub new_value: String,
    pub action: EntryAction,
    pub status: EntryStatus,
    pub error: Option<String>,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionBatch {
    pub id: i64,
    pub session_id: String,
    pub sequence: i64,
    pub entry_ids: Vec<i64>,
    pub status: BatchStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub session_id: String,
    pub kind: JobKind,
    pub entry_ids: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_status_names_are_stable() {
        for status in [
            EntryStatus::Found,
            EntryStatus::Duplicate,
            EntryStatus::NotFound,
            EntryStatus::Completed,
            EntryStatus::Error,
            EntryStatus::UndoFailed,
        ] {
            assert_eq!(EntryStatus::parse_state(status.as_str()), Some(status));
        }
        assert_eq!(EntryStatus::parse_state("updated"), None);
    }

    #[test]
    fn both_target_searches_contacts_first() {
        assert_eq!(
            TargetKind::Both.entity_kinds(),
            &[EntityKind::Contact, EntityKind::Company]
        );
        assert_eq!(TargetKind::parse_state("companies"), Some(TargetKind::Companies));
        assert_eq!(TargetKind::parse_state("leads"), None);
    }
}
