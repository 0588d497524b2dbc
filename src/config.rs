//! Configuration loader and validator for the campaign dispatch service.
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
    pub queue: Queue,
    pub campaign: CampaignPolicy,
    pub health: Health,
    pub breaker: Breaker,
    pub provider: Provider,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
}

/// Dispatch queue worker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub worker_count: u32,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    pub lease_seconds: u64,
    pub send_delay_ms: u64,
    pub recovery_sweep_secs: u64,
}

/// Campaign policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignPolicy {
    pub horizon_days: i64,
}

/// Connection health manager settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Health {
    pub settle_ms: u64,
    pub stuck_after_secs: i64,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Breaker {
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
}

/// WhatsApp provider API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provider {
    pub base_url: String,
    pub api_key: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
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
    if cfg.app.bind_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind_addr must be non-empty"));
    }

    if cfg.queue.worker_count == 0 {
        return Err(ConfigError::Invalid("queue.worker_count must be > 0"));
    }
    if cfg.queue.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("queue.poll_interval_ms must be > 0"));
    }
    if cfg.queue.lease_seconds == 0 {
        return Err(ConfigError::Invalid("queue.lease_seconds must be > 0"));
    }
    if cfg.queue.recovery_sweep_secs == 0 {
        return Err(ConfigError::Invalid("queue.recovery_sweep_secs must be > 0"));
    }
    // max_backoff_seconds and send_delay_ms may be 0 (no cap, no pacing)

    if cfg.campaign.horizon_days <= 0 {
        return Err(ConfigError::Invalid("campaign.horizon_days must be > 0"));
    }

    if cfg.health.stuck_after_secs <= 0 {
        return Err(ConfigError::Invalid("health.stuck_after_secs must be > 0"));
    }

    if cfg.breaker.failure_threshold == 0 {
        return Err(ConfigError::Invalid("breaker.failure_threshold must be > 0"));
    }
    if cfg.breaker.open_timeout_secs == 0 {
        return Err(ConfigError::Invalid("breaker.open_timeout_secs must be > 0"));
    }

    if cfg.provider.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("provider.base_url must be non-empty"));
    }
    if cfg.provider.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("provider.api_key must be non-empty"));
    }

    Ok(())
}

/// Returns the example YAML content shipped with the service.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "0.0.0.0:8080"

queue:
  worker_count: 2
  poll_interval_ms: 500
  max_backoff_seconds: 3600
  lease_seconds: 120
  send_delay_ms: 1000
  recovery_sweep_secs: 60

campaign:
  horizon_days: 30

health:
  settle_ms: 1500
  stuck_after_secs: 30

breaker:
  failure_threshold: 5
  open_timeout_secs: 60

provider:
  base_url: "http://localhost:3000"
  api_key: "YOUR_PROVIDER_API_KEY"
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
        assert_eq!(cfg.campaign.horizon_days, 30);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.open_timeout_secs, 60);
    }

    #[test]
    fn invalid_api_key() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.provider.api_key = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("provider.api_key")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_worker_count() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.queue.worker_count = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("worker_count")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_thresholds() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.breaker.failure_threshold = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.campaign.horizon_days = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.health.stuck_after_secs = 0;
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
        assert_eq!(cfg.queue.worker_count, 2);
    }
}
