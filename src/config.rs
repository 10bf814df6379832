//! Configuration loader and validator for the grovesync daemon.
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
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub sync: SyncOptions,
    pub remote: Remote,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub data_dir: String,
}

/// Drain-loop and backoff tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncOptions {
    pub drain_interval_secs: u64,
    pub max_in_flight: usize,
    pub backoff_base_seconds: u64,
    pub max_backoff_seconds: u64,
}

/// Remote ledger API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Remote {
    pub base_url: String,
    pub token: String,
    pub probe_interval_secs: u64,
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

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.sync.drain_interval_secs == 0 {
        return Err(ConfigError::Invalid("sync.drain_interval_secs must be > 0"));
    }
    if cfg.sync.max_in_flight == 0 {
        return Err(ConfigError::Invalid("sync.max_in_flight must be >= 1"));
    }
    if cfg.sync.backoff_base_seconds == 0 {
        return Err(ConfigError::Invalid("sync.backoff_base_seconds must be > 0"));
    }
    if cfg.sync.max_backoff_seconds < cfg.sync.backoff_base_seconds {
        return Err(ConfigError::Invalid(
            "sync.max_backoff_seconds must be >= sync.backoff_base_seconds",
        ));
    }

    if !cfg.remote.base_url.starts_with("http://") && !cfg.remote.base_url.starts_with("https://") {
        return Err(ConfigError::Invalid(
            "remote.base_url must include http:// or https://",
        ));
    }
    if cfg.remote.token.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.token must be non-empty"));
    }
    if cfg.remote.probe_interval_secs == 0 {
        return Err(ConfigError::Invalid("remote.probe_interval_secs must be > 0"));
    }

    Ok(())
}

/// Example YAML config, also used by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

sync:
  drain_interval_secs: 60
  max_in_flight: 1
  backoff_base_seconds: 5
  max_backoff_seconds: 3600

remote:
  base_url: "https://ledger.example.org/"
  token: "YOUR_LEDGER_API_TOKEN"
  probe_interval_secs: 15
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_remote_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.remote.base_url = "ledger.example.org".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("base_url")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.remote.token = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_sync_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sync.max_in_flight = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sync.max_backoff_seconds = 1;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("max_backoff_seconds")),
            _ => panic!("wrong error"),
        }
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
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(example().as_bytes()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.sync.drain_interval_secs, 60);
    }
}
