//! YAML configuration. Every field has a default, so an empty file (or no
//! file at all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Duration as Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::retry::DEFAULT_MAX_ATTEMPTS;
use crate::CodeLanguage;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Model id or alias (opus, sonnet, haiku).
    pub model: String,
    pub max_tokens: u32,
    pub language: CodeLanguage,
    /// Turns sent with each synthesis call.
    pub history_window: usize,
    /// Turns kept in the session.
    pub history_retention: usize,
    pub max_attempts: u32,
    /// Per execution attempt.
    pub timeout_secs: u64,
    pub code_dir: PathBuf,
    pub output_dir: PathBuf,
    pub symbols: Vec<String>,
    pub lookback_days: i64,
    pub signal_column: Option<String>,
    pub cache_ttl_secs: u64,
    /// Never call the live market source.
    pub offline: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".into(),
            max_tokens: 4096,
            language: CodeLanguage::Python,
            history_window: 10,
            history_retention: 50,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout_secs: 60,
            code_dir: PathBuf::from("quantloop/code"),
            output_dir: PathBuf::from("quantloop/output"),
            symbols: vec!["SPY".into()],
            lookback_days: 5 * 365,
            signal_column: None,
            cache_ttl_secs: 24 * 60 * 60,
            offline: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        // serde_yaml reads an empty document as null, not an empty mapping.
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout_secs must be at least 1".into()));
        }
        if self.symbols.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid("symbols must name at least one ticker".into()));
        }
        if self.lookback_days <= 0 {
            return Err(ConfigError::Invalid("lookback_days must be positive".into()));
        }
        if self.code_dir == self.output_dir {
            return Err(ConfigError::Invalid(
                "code_dir and output_dir must be different directories".into(),
            ));
        }
        Ok(())
    }

    /// Default analysis range: `lookback_days` before today, through today.
    pub fn date_range(&self) -> (NaiveDate, NaiveDate) {
        let end = Utc::now().date_naive();
        (end - Days::days(self.lookback_days), end)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let (start_date, end_date) = self.date_range();
        EngineConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            symbols: self
                .symbols
                .iter()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            start_date,
            end_date,
            output_dir: self.output_dir.clone(),
            signal_column: self.signal_column.clone(),
        }
    }
}
