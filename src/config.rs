//! Configuration loader and validator for the scheduling engine.
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
    pub scheduling: Scheduling,
    pub sharing: Sharing,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_publish_attempts: u32,
}

/// Slot allocation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduling {
    pub slot_minutes: u32,
    pub working_hours: WorkingHours,
    pub horizon_days: u32,
}

/// Default publish window, hours in 0-23 local to the team.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkingHours {
    pub start: u32,
    pub end: u32,
}

/// Shared-draft settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sharing {
    pub default_ttl_days: u32,
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
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_publish_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_publish_attempts must be >= 1"));
    }

    if cfg.scheduling.slot_minutes < 5 {
        return Err(ConfigError::Invalid("scheduling.slot_minutes must be >= 5"));
    }
    let hours = cfg.scheduling.working_hours;
    if hours.start >= hours.end || hours.end > 24 {
        return Err(ConfigError::Invalid(
            "scheduling.working_hours must satisfy 0 <= start < end <= 24",
        ));
    }
    if cfg.scheduling.horizon_days == 0 {
        return Err(ConfigError::Invalid("scheduling.horizon_days must be >= 1"));
    }

    if cfg.sharing.default_ttl_days == 0 {
        return Err(ConfigError::Invalid("sharing.default_ttl_days must be >= 1"));
    }

    Ok(())
}

/// Example YAML shipped with the binary and used by the tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_publish_attempts: 3

scheduling:
  slot_minutes: 30
  working_hours:
    start: 9
    end: 17
  horizon_days: 30

sharing:
  default_ttl_days: 14
"#
}
