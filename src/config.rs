//! Configuration loader and validator for the publishing daemon.
use crate::model::DestinationType;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
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
    pub vault: Vault,
    pub media: Media,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub scan_interval_ms: u64,
    pub scan_batch_limit: u32,
    pub worker_concurrency: u32,
    pub job_poll_interval_ms: u64,
    pub job_history_limit: u32,
    pub stalled_job_timeout_seconds: u64,
}

/// Where the process-wide vault key comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vault {
    pub key_env: String,
}

/// Media resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Media {
    pub root_dir: String,
    #[serde(default)]
    pub public_base_url: Option<String>,
}

/// One configured publishing destination (OAuth2 client + endpoints).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Destination {
    #[serde(rename = "type")]
    pub kind: DestinationType,
    pub token_url: String,
    pub publish_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` and `media.root_dir`).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        for dir in [&self.app.data_dir, &self.media.root_dir] {
            if dir.trim().is_empty() {
                continue;
            }
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/postpilot.db", self.app.data_dir))
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
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.scan_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.scan_interval_ms must be > 0"));
    }
    if cfg.app.scan_batch_limit == 0 {
        return Err(ConfigError::Invalid("app.scan_batch_limit must be > 0"));
    }
    if cfg.app.worker_concurrency == 0 {
        return Err(ConfigError::Invalid("app.worker_concurrency must be > 0"));
    }
    if cfg.app.job_poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.job_poll_interval_ms must be > 0"));
    }
    if cfg.app.job_history_limit == 0 {
        return Err(ConfigError::Invalid("app.job_history_limit must be > 0"));
    }
    if cfg.app.stalled_job_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "app.stalled_job_timeout_seconds must be > 0",
        ));
    }

    if cfg.vault.key_env.trim().is_empty() {
        return Err(ConfigError::Invalid("vault.key_env must be non-empty"));
    }

    if cfg.media.root_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("media.root_dir must be non-empty"));
    }
    if let Some(base) = cfg.media.public_base_url.as_deref() {
        if Url::parse(base).is_err() {
            return Err(ConfigError::Invalid("media.public_base_url must be a valid URL"));
        }
    }

    let mut seen = HashSet::new();
    for dest in &cfg.destinations {
        if !seen.insert(dest.kind) {
            return Err(ConfigError::Invalid("destinations[].type must be unique"));
        }
        if Url::parse(&dest.token_url).is_err() {
            return Err(ConfigError::Invalid("destinations[].token_url must be a valid URL"));
        }
        if Url::parse(&dest.publish_url).is_err() {
            return Err(ConfigError::Invalid(
                "destinations[].publish_url must be a valid URL",
            ));
        }
        if dest.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("destinations[].client_id must be non-empty"));
        }
        if dest.client_secret.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "destinations[].client_secret must be non-empty",
            ));
        }
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  scan_interval_ms: 30000
  scan_batch_limit: 50
  worker_concurrency: 4
  job_poll_interval_ms: 500
  job_history_limit: 100
  stalled_job_timeout_seconds: 900

vault:
  key_env: "POSTPILOT_VAULT_KEY"

media:
  root_dir: "./data/media"
  public_base_url: "https://cdn.example.com/media/"

destinations:
  - type: mastodon
    token_url: "https://mastodon.example/oauth/token"
    publish_url: "https://mastodon.example/api/v1/statuses"
    client_id: "MASTODON_CLIENT_ID"
    client_secret: "MASTODON_CLIENT_SECRET"
  - type: linkedin
    token_url: "https://www.linkedin.com/oauth/v2/accessToken"
    publish_url: "https://api.linkedin.com/v2/posts"
    client_id: "LINKEDIN_CLIENT_ID"
    client_secret: "LINKEDIN_CLIENT_SECRET"
"#
}
