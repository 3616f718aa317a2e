use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::{Client, Url};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Crm;
use crate::crm::model::{BatchResult, Entity, ErrorBody};
use crate::model::EntityKind;

pub mod model;
pub mod rate_limit;

pub use rate_limit::RateLimiter;

/// Upper bound on commands in a single `batch` call.
pub const MAX_BATCH_COMMANDS: usize = 50;

/// Field name -> value to write, in column order.
pub type FieldValues = IndexMap<String, String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrmError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("CRM error {code}: {description}")]
    Api { code: String, description: String },
    #[error("unexpected CRM response: {0}")]
    Decode(String),
}

/// One record's changes inside a bulk update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub id: String,
    pub fields: FieldValues,
}

#[async_trait]
pub trait CrmService: Send + Sync {
    async fn search(
        &self,
        kind: EntityKind,
        field: &str,
        value: &str,
    ) -> Result<Vec<Entity>, CrmError>;

    async fn update(&self, kind: EntityKind, id: &str, fields: &FieldValues)
        -> Result<(), CrmError>;

    /// Apply all updates in one call; the call fails as a whole.
    async fn bulk_update(&self, kind: EntityKind, updates: &[RecordUpdate])
        -> Result<(), CrmError>;
}

#[derive(Clone)]
pub struct CrmClient {
    http: Client,
    base_url: Url,
    auth_token: String,
    limiter: Arc<RateLimiter>,
}

impl fmt::Debug for CrmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrmClient")
            .field("base_url", &self.base_url)
            .field("min_interval", &self.limiter.min_interval())
            .finish_non_exhaustive()
    }
}

impl CrmClient {
    pub fn new(
        mut base_url: Url,
        auth_token: String,
        limiter: Arc<RateLimiter>,
    ) -> anyhow::Result<Self> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent("bulk-updater/0.1")
            .build()?;
        Ok(Self {
            http,
            base_url,
            auth_token,
            limiter,
        })
    }

    pub fn from_config(cfg: &Crm, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let base_url = Url::parse(&cfg.base_url)?;
        Self::new(base_url, cfg.auth_token.clone(), limiter)
    }

    /// Limiter shared with every other client built from the same config.
    pub fn shared_limiter(cfg: &Crm) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(Duration::from_millis(cfg.min_interval_ms)))
    }

    pub fn build_request(&self, method: &str, params: &Value) -> Result<reqwest::Request, CrmError> {
        let endpoint = self
            .base_url
            .join(&format!("rest/{}.json", method))
            .map_err(|e| CrmError::Transport(format!("invalid endpoint for {}: {}", method, e)))?;
        let mut body = match params {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(CrmError::Decode(format!(
                    "params for {} must be an object, got {}",
                    method, other
                )))
            }
        };
        body.insert("auth".into(), Value::String(self.auth_token.clone()));
        self.http
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(&Value::Object(body))
            .build()
            .map_err(|e| CrmError::Transport(e.to_string()))
    }

    /// Rate-limited call of a REST method; returns the `result` payload.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CrmError> {
        let request = self.build_request(method, &params)?;
        self.limiter.acquire().await;
        debug!(method, url = %request.url(), "crm request");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| CrmError::Transport(format!("failed to reach CRM: {}", e)))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| CrmError::Transport(format!("failed to read CRM response: {}", e)))?;
        if !status.is_success() {
            warn!(method, %status, body = %text, "crm returned non-success status");
            return Err(CrmError::Transport(format!("CRM status {}: {}", status, text)));
        }
        parse_response(&text)
    }
}

/// Decode a response body into its `result`, surfacing body-level errors.
pub fn parse_response(text: &str) -> Result<Value, CrmError> {
    let body: Value =
        serde_json::from_str(text).map_err(|e| CrmError::Decode(format!("invalid JSON: {}", e)))?;
    if body.get("error").is_some() {
        let err: ErrorBody =
            serde_json::from_value(body).map_err(|e| CrmError::Decode(e.to_string()))?;
        let code = match err.error {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return Err(CrmError::Api {
            description: err.error_description.unwrap_or_else(|| code.clone()),
            code,
        });
    }
    match body {
        Value::Object(mut map) => map
            .remove("result")
            .ok_or_else(|| CrmError::Decode("response has no result".into())),
        other => Err(CrmError::Decode(format!("unexpected body: {}", other))),
    }
}

fn method_family(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Contact => "crm.contact",
        EntityKind::Company => "crm.company",
    }
}

pub fn build_search_params(field: &str, value: &str) -> Value {
    let mut filter = Map::new();
    filter.insert(field.to_string(), Value::String(value.to_string()));
    let mut select = vec!["*", "UF_*", "EMAIL", "PHONE"];
    if !select.contains(&field) {
        select.push(field);
    }
    json!({ "filter": Value::Object(filter), "select": select })
}

pub fn build_update_params(id: &str, fields: &FieldValues) -> Value {
    let fields: Map<String, Value> = fields
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    json!({ "id": id, "fields": Value::Object(fields) })
}

/// One `cmd` entry per record, each an encoded `<family>.update` query.
pub fn build_batch_params(kind: EntityKind, updates: &[RecordUpdate]) -> Value {
    let family = method_family(kind);
    let mut cmd = Map::new();
    for (idx, update) in updates.iter().enumerate() {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("id", &update.id);
        for (field, value) in &update.fields {
            query.append_pair(&format!("fields[{}]", field), value);
        }
        cmd.insert(
            format!("u{}", idx),
            Value::String(format!("{}.update?{}", family, query.finish())),
        );
    }
    json!({ "halt": 0, "cmd": Value::Object(cmd) })
}

#[async_trait]
impl CrmService for CrmClient {
    async fn search(
        &self,
        kind: EntityKind,
        field: &str,
        value: &str,
    ) -> Result<Vec<Entity>, CrmError> {
        let method = format!("{}.list", method_family(kind));
        let result = self.call(&method, build_search_params(field, value)).await?;
        match result {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(fields) => Some(Entity::new(kind, fields)),
                    _ => None,
                })
                .collect()),
            other => Err(CrmError::Decode(format!(
                "{} returned non-list result: {}",
                method, other
            ))),
        }
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        fields: &FieldValues,
    ) -> Result<(), CrmError> {
        let method = format!("{}.update", method_family(kind));
        let result = self.call(&method, build_update_params(id, fields)).await?;
        if result == Value::Bool(false) {
            return Err(CrmError::Api {
                code: "update_rejected".into(),
                description: format!("{} {} was not updated", kind.as_str(), id),
            });
        }
        Ok(())
    }

    async fn bulk_update(
        &self,
        kind: EntityKind,
        updates: &[RecordUpdate],
    ) -> Result<(), CrmError> {
        if updates.is_empty() {
            return Ok(());
        }
        if updates.len() > MAX_BATCH_COMMANDS {
            return Err(CrmError::Decode(format!(
                "{} updates exceed the {} command limit",
                updates.len(),
                MAX_BATCH_COMMANDS
            )));
        }
        let result = self
            .call("batch", build_batch_params(kind, updates))
            .await?;
        let batch: BatchResult =
            serde_json::from_value(result).map_err(|e| CrmError::Decode(e.to_string()))?;
        let errors = batch.errors();
        if !errors.is_empty() {
            return Err(CrmError::Api {
                code: "batch_failed".into(),
                description: errors.join("; "),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CrmClient {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(500)));
        CrmClient::new(
            Url::parse("https://portal.example.com/base").unwrap(),
            "tok".into(),
            limiter,
        )
        .unwrap()
    }

    #[test]
    fn build_request_targets_method_endpoint_with_auth() {
        let c = client();
        let request = c
            .build_request("crm.contact.list", &json!({ "filter": {} }))
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/base/rest/crm.contact.list.json");
        let body: Value =
            serde_json::from_slice(request.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["auth"], "tok");
        assert_eq!(body["filter"], json!({}));
    }

    #[test]
    fn build_request_rejects_non_object_params() {
        let c = client();
        assert!(matches!(
            c.build_request("batch", &json!([1, 2])),
            Err(CrmError::Decode(_))
        ));
    }

    #[test]
    fn parse_response_distinguishes_api_errors() {
        assert_eq!(parse_response(r#"{"result": [1]}"#).unwrap(), json!([1]));
        assert_eq!(
            parse_response(r#"{"error": "QUERY_LIMIT_EXCEEDED", "error_description": "Too many requests"}"#),
            Err(CrmError::Api {
                code: "QUERY_LIMIT_EXCEEDED".into(),
                description: "Too many requests".into()
            })
        );
        assert!(matches!(parse_response("<html>"), Err(CrmError::Decode(_))));
        assert!(matches!(parse_response(r#"{"total": 0}"#), Err(CrmError::Decode(_))));
    }

    #[test]
    fn search_params_select_the_search_field() {
        let p = build_search_params("UF_CRM_INN", "7701");
        assert_eq!(p["filter"]["UF_CRM_INN"], "7701");
        let select: Vec<&str> = p["select"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(select.contains(&"UF_CRM_INN"));
        assert_eq!(build_search_params("EMAIL", "a@x.io")["select"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn batch_params_encode_one_command_per_record() {
        let mut fields = FieldValues::new();
        fields.insert("NAME".into(), "New & Co".into());
        let updates = vec![
            RecordUpdate {
                id: "5".into(),
                fields: fields.clone(),
            },
            RecordUpdate {
                id: "6".into(),
                fields,
            },
        ];
        let p = build_batch_params(EntityKind::Company, &updates);
        assert_eq!(p["halt"], 0);
        assert_eq!(
            p["cmd"]["u0"],
            "crm.company.update?id=5&fields%5BNAME%5D=New+%26+Co"
        );
        assert!(p["cmd"]["u1"].as_str().unwrap().contains("id=6"));
    }

    #[test]
    fn update_params_wrap_fields() {
        let mut fields = FieldValues::new();
        fields.insert("TITLE".into(), "Acme".into());
        let p = build_update_params("12", &fields);
        assert_eq!(p, json!({ "id": "12", "fields": { "TITLE": "Acme" } }));
    }
}
