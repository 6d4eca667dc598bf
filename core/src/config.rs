use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Smallest string ceiling that still leaves room for the truncation marker.
pub const MIN_STRING_CHARS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config value '{field}': {message}")]
    Invalid { field: String, message: String },
}

/// Configuration document, loaded once at startup and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub bounding: BoundingConfig,
    pub auto_approve: AutoApproveConfig,
    pub default_params: DefaultParamsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub requests_per_second: u32,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Ceiling applied to upstream `Retry-After` hints.
    pub max_retry_after_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.netdash.io/api/v1".to_string(),
            timeout_secs: 30,
            requests_per_second: 5,
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 8000,
            max_retry_after_secs: 60,
        }
    }
}

/// Ceilings for structural bounding and cardinality summarization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundingConfig {
    pub max_items: usize,
    pub max_string_chars: usize,
    pub drop_nulls: bool,
    pub summarize_above_bytes: usize,
    pub summarize_above_items: Option<usize>,
    pub summary_items: usize,
    pub facet_sample_size: usize,
}

impl Default for BoundingConfig {
    fn default() -> Self {
        Self {
            max_items: 50,
            max_string_chars: 2000,
            drop_nulls: true,
            summarize_above_bytes: 24_000,
            summarize_above_items: None,
            summary_items: 5,
            facet_sample_size: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoApproveConfig {
    /// Master switch; when off every tool requires approval.
    pub enabled: bool,
    pub approve_all: bool,
    pub patterns: Vec<String>,
    pub tools: Vec<String>,
    pub exclude: Vec<String>,
    pub read_only_heuristic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDefaults {
    pub pattern: String,
    pub params: Map<String, Value>,
}

/// Default parameters keyed by glob pattern (in declaration order) or by
/// exact tool name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultParamsConfig {
    pub patterns: Vec<PatternDefaults>,
    pub tools: Map<String, Value>,
}

pub fn config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("netdash");
    config_dir.join("config.json")
}

impl AppConfig {
    /// Load from an explicit path (must exist) or from the default location
    /// (missing file yields defaults).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (config_path(), false),
        };
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        let config = Self::from_json_str(&data).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.clone(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            serde_json::from_str(data).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.requests_per_second == 0 {
            return Err(invalid("api.requests_per_second", "must be at least 1"));
        }
        if self.api.max_attempts == 0 {
            return Err(invalid("api.max_attempts", "must be at least 1"));
        }
        if self.api.timeout_secs == 0 {
            return Err(invalid("api.timeout_secs", "must be at least 1"));
        }
        if self.bounding.max_items == 0 {
            return Err(invalid("bounding.max_items", "must be at least 1"));
        }
        if self.bounding.max_string_chars < MIN_STRING_CHARS {
            return Err(invalid(
                "bounding.max_string_chars",
                format!("must be at least {MIN_STRING_CHARS}"),
            ));
        }
        for (name, value) in &self.default_params.tools {
            if !value.is_object() {
                return Err(invalid(
                    format!("default_params.tools.{name}"),
                    "must be an object",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        message: message.into(),
    }
}
