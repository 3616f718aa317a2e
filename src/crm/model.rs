use serde::Deserialize;
use serde_json::{Map, Value};

use crate::model::EntityKind;

/// A CRM record as returned by the list endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub kind: EntityKind,
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(kind: EntityKind, fields: Map<String, Value>) -> Self {
        Self { kind, fields }
    }

    pub fn id(&self) -> Option<String> {
        self.fields.get("ID").and_then(flatten_value)
    }

    /// Field value flattened to text; `None` when absent or null.
    pub fn value(&self, field: &str) -> Option<String> {
        self.fields.get(field).and_then(flatten_value)
    }
}

/// Multi-value fields (`[{"VALUE": ..}, ..]`) read as their first `VALUE`.
pub fn flatten_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "Y".into() } else { "N".into() }),
        Value::Array(items) => items.first().and_then(|first| match first {
            Value::Object(obj) => obj.get("VALUE").and_then(flatten_value),
            other => flatten_value(other),
        }),
        Value::Object(obj) => obj.get("VALUE").and_then(flatten_value),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: Value,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BatchResult {
    #[serde(default)]
    pub result_error: Value,
}

impl BatchResult {
    /// Per-command error messages; an empty list means every command succeeded.
    pub fn errors(&self) -> Vec<String> {
        match &self.result_error {
            Value::Object(map) => map
                .iter()
                .map(|(cmd, err)| format!("{}: {}", cmd, describe_error(err)))
                .collect(),
            Value::Array(items) => items.iter().map(describe_error).collect(),
            _ => Vec::new(),
        }
    }
}

fn describe_error(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("error_description")
            .or_else(|| obj.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_multi_value_fields() {
        let v = json!([{ "ID": "9", "VALUE": "a@x.io", "VALUE_TYPE": "WORK" }]);
        assert_eq!(flatten_value(&v).as_deref(), Some("a@x.io"));
        assert_eq!(flatten_value(&json!([])), None);
        assert_eq!(flatten_value(&json!(null)), None);
        assert_eq!(flatten_value(&json!(42)).as_deref(), Some("42"));
    }

    #[test]
    fn entity_reads_id_and_fields() {
        let fields = json!({ "ID": "17", "NAME": "Old", "PHONE": null });
        let e = Entity::new(EntityKind::Contact, fields.as_object().unwrap().clone());
        assert_eq!(e.id().as_deref(), Some("17"));
        assert_eq!(e.value("NAME").as_deref(), Some("Old"));
        assert_eq!(e.value("PHONE"), None);
        assert_eq!(e.value("MISSING"), None);
    }

    #[test]
    fn batch_errors_from_object_and_array() {
        let r: BatchResult = serde_json::from_value(json!({
            "result": { "u0": true },
            "result_error": { "u1": { "error": "", "error_description": "Not found" } }
        }))
        .unwrap();
        assert_eq!(r.errors(), vec!["u1: Not found".to_string()]);

        let ok: BatchResult = serde_json::from_value(json!({ "result_error": [] })).unwrap();
        assert!(ok.errors().is_empty());
    }
}
