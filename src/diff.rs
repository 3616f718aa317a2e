//! Turns a matched row into reviewable pending changes.
use crate::db::NewEntry;
use crate::matcher::MatchOutcome;
use crate::model::{EntryAction, EntryStatus, Row};

/// One entry per non-key column of `row`, whatever the match outcome.
pub fn build_entries(
    row_index: usize,
    row: &Row,
    key_columns: &[String],
    outcome: &MatchOutcome,
) -> Vec<NewEntry> {
    let (status, action, selected) = match outcome {
        MatchOutcome::Found { .. } => (EntryStatus::Found, EntryAction::Update, true),
        MatchOutcome::Duplicate { .. } => (EntryStatus::Duplicate, EntryAction::Update, true),
        MatchOutcome::NotFound { .. } => (EntryStatus::NotFound, EntryAction::Ignore, false),
    };
    let entity = outcome.entity();
    let external_id = entity.and_then(|e| e.id());
    let entity_kind = entity.map(|e| e.kind);

    row.iter()
        .filter(|(column, _)| !key_columns.contains(*column))
        .map(|(field, value)| NewEntry {
            row_index: row_index as i64,
            search_key: outcome.search_key().to_string(),
            external_id: external_id.clone(),
            entity_kind,
            field: field.clone(),
            current_value: entity.map(|e| e.value(field).unwrap_or_default()),
            new_value: value.clone(),
            action,
            status,
            selected,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::model::Entity;
    use crate::model::EntityKind;
    use serde_json::json;

    fn row() -> Row {
        [("EMAIL", "a@x.io"), ("NAME", "New"), ("CITY", "")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn entity() -> Entity {
        let fields = json!({ "ID": "42", "NAME": "Old" });
        Entity::new(EntityKind::Company, fields.as_object().unwrap().clone())
    }

    #[test]
    fn found_row_proposes_updates_for_non_key_fields() {
        let outcome = MatchOutcome::Found {
            search_key: "EMAIL=a@x.io".into(),
            entity: entity(),
        };
        let entries = build_entries(3, &row(), &["EMAIL".to_string()], &outcome);
        assert_eq!(entries.len(), 2);

        let name = &entries[0];
        assert_eq!(name.field, "NAME");
        assert_eq!(name.row_index, 3);
        assert_eq!(name.current_value.as_deref(), Some("Old"));
        assert_eq!(name.new_value, "New");
        assert_eq!(name.status, EntryStatus::Found);
        assert_eq!(name.action, EntryAction::Update);
        assert_eq!(name.external_id.as_deref(), Some("42"));
        assert_eq!(name.entity_kind, Some(EntityKind::Company));
        assert!(name.selected);

        // absent on the record reads as empty, not null
        assert_eq!(entries[1].field, "CITY");
        assert_eq!(entries[1].current_value.as_deref(), Some(""));
    }

    #[test]
    fn duplicate_row_is_selected_update() {
        let outcome = MatchOutcome::Duplicate {
            search_key: "EMAIL=a@x.io".into(),
            entity: entity(),
            candidates: 3,
        };
        let entries = build_entries(0, &row(), &["EMAIL".to_string()], &outcome);
        assert!(entries
            .iter()
            .all(|e| e.status == EntryStatus::Duplicate && e.selected));
    }

    #[test]
    fn not_found_row_is_ignored_and_deselected() {
        let outcome = MatchOutcome::NotFound {
            search_key: "EMAIL=a@x.io".into(),
        };
        let entries = build_entries(1, &row(), &["EMAIL".to_string()], &outcome);
        assert_eq!(entries.len(), 2);
        for e in &entries {
            assert_eq!(e.status, EntryStatus::NotFound);
            assert_eq!(e.action, EntryAction::Ignore);
            assert!(!e.selected);
            assert!(e.current_value.is_none());
            assert!(e.external_id.is_none());
        }
    }

    #[test]
    fn entry_count_equals_non_key_columns_for_every_outcome() {
        let keys = vec!["EMAIL".to_string(), "CITY".to_string()];
        let outcomes = [
            MatchOutcome::Found {
                search_key: String::new(),
                entity: entity(),
            },
            MatchOutcome::Duplicate {
                search_key: String::new(),
                entity: entity(),
                candidates: 2,
            },
            MatchOutcome::NotFound {
                search_key: String::new(),
            },
        ];
        for outcome in &outcomes {
            assert_eq!(build_entries(0, &row(), &keys, outcome).len(), 1);
        }
    }
}
