//! Row-by-row lookup of CRM records by key columns.
use tracing::{debug, instrument, warn};

use crate::crm::model::Entity;
use crate::crm::CrmService;
use crate::model::{Row, TargetKind};

/// Terminal classification of one input row.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Found {
        search_key: String,
        entity: Entity,
    },
    /// More than one record matched; the first one is used.
    Duplicate {
        search_key: String,
        entity: Entity,
        candidates: usize,
    },
    NotFound {
        search_key: String,
    },
}

impl MatchOutcome {
    pub fn search_key(&self) -> &str {
        match self {
            MatchOutcome::Found { search_key, .. }
            | MatchOutcome::Duplicate { search_key, .. }
            | MatchOutcome::NotFound { search_key } => search_key,
        }
    }

    pub fn entity(&self) -> Option<&Entity> {
        match self {
            MatchOutcome::Found { entity, .. } | MatchOutcome::Duplicate { entity, .. } => {
                Some(entity)
            }
            MatchOutcome::NotFound { .. } => None,
        }
    }
}

/// Try key columns in priority order and stop at the first one that matches.
///
/// Empty key values are skipped. A failed search is logged and the next key
/// column is tried; it never fails the row.
#[instrument(skip_all, fields(target = target.as_str()))]
pub async fn match_row(
    crm: &dyn CrmService,
    row: &Row,
    key_columns: &[String],
    target: TargetKind,
) -> MatchOutcome {
    let mut tried = Vec::new();

    for column in key_columns {
        let value = row.get(column).map(|v| v.trim()).unwrap_or("");
        if value.is_empty() {
            continue;
        }
        let search_key = format!("{}={}", column, value);
        tried.push(search_key.clone());

        let mut results = Vec::new();
        let mut failed = false;
        for kind in target.entity_kinds() {
            match crm.search(*kind, column, value).await {
                Ok(found) => results.extend(found),
                Err(err) => {
                    warn!(%err, column = %column, kind = kind.as_str(), "search failed; trying next key column");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            continue;
        }

        let returned = results.len();
        // a record without an id can never be updated
        results.retain(|entity| entity.id().is_some());
        if results.len() < returned {
            warn!(search_key = %search_key, dropped = returned - results.len(), "ignoring records without ID");
        }
        debug!(search_key = %search_key, matches = results.len(), "searched");
        let candidates = results.len();
        let mut results = results.into_iter();
        match (results.next(), candidates) {
            (Some(entity), 1) => return MatchOutcome::Found { search_key, entity },
            (Some(entity), _) => {
                return MatchOutcome::Duplicate {
                    search_key,
                    entity,
                    candidates,
                }
            }
            (None, _) => {}
        }
    }

    MatchOutcome::NotFound {
        search_key: tried.join("; "),
    }
}
