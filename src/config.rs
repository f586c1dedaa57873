use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::reconcile::ReconcileConfig;

/// Application-level constants
pub const APP_NAME: &str = "PopReconcile";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable holding the extraction API key. Never read from the config file.
pub const API_KEY_ENV: &str = "POP_RECONCILE_API_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot determine home directory")]
    NoHomeDir,

    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid setting: {0}")]
    Invalid(String),

    #[error("Missing setting: {0}")]
    Missing(&'static str),
}

/// Get the application data directory
/// ~/PopReconcile/ on all platforms
pub fn app_data_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(APP_NAME))
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(app_data_dir()?.join("config.json"))
}

/// Local state store location
pub fn default_state_db_path() -> Result<PathBuf, ConfigError> {
    Ok(app_data_dir()?.join("pop_local_state.sqlite"))
}

/// Log file for the day the process started.
pub fn log_file_name(date: chrono::NaiveDate) -> String {
    format!("pop-reconcile-{}.log", date.format("%Y-%m-%d"))
}

/// Fallback for `RUST_LOG`.
pub fn default_log_filter() -> &'static str {
    "pop_reconcile=info,warn"
}

/// Extraction API key from the environment; blank counts as unset.
pub fn api_key_from_env() -> Option<String> {
    std::env::var(API_KEY_ENV)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

/// Everything the binary needs: where things live, plus the pipeline settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Local state store; defaults to `~/PopReconcile/pop_local_state.sqlite`.
    pub state_db_path: Option<PathBuf>,
    pub remote_db_path: Option<PathBuf>,
    pub extraction_endpoint: Option<String>,
    /// Base directory for relative document paths.
    pub documents_root: Option<PathBuf>,
    /// When set, logs are also appended to a dated file here.
    pub log_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub pipeline: ReconcileConfig,
}

impl AppConfig {
    pub fn state_db_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.state_db_path {
            Some(path) => Ok(path.clone()),
            None => default_state_db_path(),
        }
    }

    pub fn remote_db_path(&self) -> Result<&Path, ConfigError> {
        self.remote_db_path
            .as_deref()
            .ok_or(ConfigError::Missing("remote_db_path"))
    }

    pub fn extraction_endpoint(&self) -> Result<&str, ConfigError> {
        self.extraction_endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or(ConfigError::Missing("extraction_endpoint"))
    }
}

/// Load the config from `path`, or from the default location when `None`.
///
/// An explicit path must exist; a missing default file yields the defaults.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (default_config_path()?, false),
    };

    let config = if !required && !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        AppConfig::default()
    } else {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?
    };

    config.pipeline.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn app_data_dir_under_home() {
        let dir = app_data_dir().unwrap();
        let home = dirs::home_dir().unwrap();
        assert!(dir.starts_with(home));
        assert!(dir.ends_with("PopReconcile"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let (_dir, path) = write_config(
            r#"{
                "remote_db_path": "/srv/uw/remote.sqlite",
                "extraction_endpoint": "https://extract.example/v1/pop",
                "max_attempts": 5,
                "require_human_approval": true,
                "log_dir": "/var/log/pop-reconcile"
            }"#,
        );
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.pipeline.max_attempts, 5);
        assert!(config.pipeline.require_human_approval);
        assert_eq!(config.pipeline.lookback_days, 100);
        assert_eq!(config.pipeline.comment_prefix_filter, "Proof of Prior");
        assert_eq!(config.remote_db_path().unwrap(), Path::new("/srv/uw/remote.sqlite"));
        assert_eq!(config.extraction_endpoint().unwrap(), "https://extract.example/v1/pop");
        assert_eq!(config.log_dir.as_deref(), Some(Path::new("/var/log/pop-reconcile")));
        assert_eq!(AppConfig::default().log_dir, None);
    }

    #[test]
    fn log_file_is_named_by_date() {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert_eq!(log_file_name(date), "pop-reconcile-2026-10-18.log");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let (_dir, path) = write_config(r#"{ "workers": 0 }"#);
        assert!(matches!(load_config(Some(&path)), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let (_dir, path) = write_config("max_attempts = 3");
        assert!(matches!(load_config(Some(&path)), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("nope.json")));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn missing_settings_are_reported_by_name() {
        let config = AppConfig::default();
        let err = config.remote_db_path().unwrap_err();
        assert_eq!(err.to_string(), "Missing setting: remote_db_path");
        assert!(config.extraction_endpoint().is_err());
    }

    #[test]
    fn app_name_is_pop_reconcile() {
        assert_eq!(APP_NAME, "PopReconcile");
    }
}
