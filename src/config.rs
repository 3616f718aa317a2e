//! Configuration loader and validator for the bulk updater.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub crm: Crm,
    pub auth: Auth,
    #[serde(default)]
    pub limits: Limits,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// External CRM endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Crm {
    pub base_url: String,
    pub auth_token: String,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Caller authentication for pipeline-triggering operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Auth {
    pub token: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

/// Upload limits enforced at session creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Limits {
    pub max_rows: usize,
    pub max_file_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_rows: 100_000,
            max_file_bytes: 50 * 1024 * 1024,
        }
    }
}

fn default_workers() -> usize {
    1
}

fn default_min_interval_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    50
}

impl App {
    /// Data dir with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/bulk.db", self.app.resolved_data_dir()))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.workers == 0 {
        return Err(ConfigError::Invalid("app.workers must be > 0"));
    }

    if cfg.crm.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("crm.base_url must be non-empty"));
    }
    if url::Url::parse(&cfg.crm.base_url).is_err() {
        return Err(ConfigError::Invalid("crm.base_url must be an absolute URL"));
    }
    if cfg.crm.auth_token.trim().is_empty() {
        return Err(ConfigError::Invalid("crm.auth_token must be non-empty"));
    }
    if cfg.crm.batch_size == 0 {
        return Err(ConfigError::Invalid("crm.batch_size must be > 0"));
    }
    if cfg.crm.batch_size > crate::crm::MAX_BATCH_COMMANDS {
        return Err(ConfigError::Invalid("crm.batch_size must be <= 50"));
    }

    if cfg.auth.token.trim().is_empty() {
        return Err(ConfigError::Invalid("auth.token must be non-empty"));
    }
    if cfg.auth.allowed_domains.iter().any(|d| d.trim().is_empty()) {
        return Err(ConfigError::Invalid(
            "auth.allowed_domains must not contain empty entries",
        ));
    }

    if cfg.limits.max_rows == 0 {
        return Err(ConfigError::Invalid("limits.max_rows must be > 0"));
    }
    if cfg.limits.max_file_bytes == 0 {
        return Err(ConfigError::Invalid("limits.max_file_bytes must be > 0"));
    }

    Ok(())
}

/// Returns the example YAML content printed by `example-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  workers: 1

crm:
  base_url: "https://portal.example.com/"
  auth_token: "YOUR_CRM_ACCESS_TOKEN"
  min_interval_ms: 500
  batch_size: 50

auth:
  token: "YOUR_SHARED_SECRET"
  allowed_domains:
    - "portal.example.com"

limits:
  max_rows: 100000
  max_file_bytes: 52428800
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.crm.batch_size, 50);
        assert_eq!(cfg.crm.min_interval_ms, 500);
    }

    #[test]
    fn defaults_apply_when_sections_are_omitted() {
        let yaml = r#"app:
  data_dir: "./data"
  poll_interval_ms: 250
crm:
  base_url: "https://portal.example.com/"
  auth_token: "t"
auth:
  token: "secret"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.workers, 1);
        assert_eq!(cfg.limits, Limits::default());
        assert!(cfg.auth.allowed_domains.is_empty());
    }

    #[test]
    fn invalid_auth_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.auth.token = "  ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("auth.token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_crm_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.crm.base_url = "not a url".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("crm.base_url")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.crm.batch_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
        cfg.crm.batch_size = 51;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.crm.auth_token = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn empty_domain_entry_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.auth.allowed_domains.push(" ".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.auth.allowed_domains, vec!["portal.example.com"]);
    }
}
