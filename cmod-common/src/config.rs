//! Configuration loading and resolution
//!
//! Bootstrap configuration lives in a small TOML file. Every field has a
//! built-in default, so a missing file is a warning, never a startup failure.
//!
//! # Resolution priority
//!
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding the classification server URL
pub const SERVER_URL_ENV: &str = "CMOD_SERVER_URL";

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "CMOD_CONFIG";

/// Compiled default classification server
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:5000";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Base URL of the classification service (`/analyze`, `/report_word` are appended)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,

    /// Stream the comments belong to, when not derived from a URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub display: DisplayConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Timing and identity parameters of the reconciliation pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Quiet period after the last structural change before a rescan
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Interval between checks for the comment container at startup
    #[serde(default = "default_container_poll_ms")]
    pub container_poll_ms: u64,

    /// Number of leading characters of a comment that feed its identity
    #[serde(default = "default_identity_prefix_chars")]
    pub identity_prefix_chars: usize,

    /// Per-request timeout for the classification service
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            container_poll_ms: default_container_poll_ms(),
            identity_prefix_chars: default_identity_prefix_chars(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn container_poll(&self) -> Duration {
        Duration::from_millis(self.container_poll_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Placeholder strings shown in place of a comment
///
/// These are also reserved: a comment whose visible text equals one of them
/// is never treated as original content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_checking_text")]
    pub checking_text: String,

    #[serde(default = "default_censored_text")]
    pub censored_text: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            checking_text: default_checking_text(),
            censored_text: default_censored_text(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_container_poll_ms() -> u64 {
    500
}

fn default_identity_prefix_chars() -> usize {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_checking_text() -> String {
    "Checking this comment...".to_string()
}

fn default_censored_text() -> String {
    "This comment was hidden by the filter.".to_string()
}

impl TomlConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        let config: TomlConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is missing
    ///
    /// A file that exists but fails to parse or validate is still an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => {
                let config = Self::load(path)?;
                info!("Configuration loaded from {}", path.display());
                Ok(config)
            }
            Some(path) => {
                warn!(
                    "Config file {} not found, using built-in defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                warn!("No config file location available, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.identity_prefix_chars == 0 {
            return Err(Error::Config(
                "pipeline.identity_prefix_chars must be at least 1".to_string(),
            ));
        }
        if self.pipeline.request_timeout_secs == 0 {
            return Err(Error::Config(
                "pipeline.request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.pipeline.container_poll_ms == 0 {
            return Err(Error::Config(
                "pipeline.container_poll_ms must be at least 1".to_string(),
            ));
        }
        if self.display.checking_text.trim().is_empty() || self.display.censored_text.trim().is_empty() {
            return Err(Error::Config("display placeholders must not be empty".to_string()));
        }
        if let Some(url) = &self.server_url {
            if !is_valid_server_url(url) {
                return Err(Error::Config(format!("server_url is not an http(s) URL: {}", url)));
            }
        }
        Ok(())
    }
}

/// Default config file location for a module (`<config_dir>/cmod/<module>.toml`)
pub fn default_config_path(module_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cmod").join(format!("{}.toml", module_name)))
}

/// Resolve the config file location: CLI → ENV → platform default
pub fn resolve_config_path(cli_arg: Option<&Path>, module_name: &str) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    default_config_path(module_name)
}

/// Resolve the classification server URL: CLI → ENV → TOML → compiled default
pub fn resolve_server_url(cli_arg: Option<&str>, toml_config: &TomlConfig) -> Result<String> {
    let env_value = std::env::var(SERVER_URL_ENV).ok();

    let (url, source) = if let Some(url) = cli_arg {
        (url.to_string(), "command line")
    } else if let Some(url) = env_value.filter(|v| !v.trim().is_empty()) {
        (url, "environment")
    } else if let Some(url) = &toml_config.server_url {
        (url.clone(), "TOML")
    } else {
        (DEFAULT_SERVER_URL.to_string(), "compiled default")
    };

    if !is_valid_server_url(&url) {
        return Err(Error::Config(format!(
            "Server URL from {} is not an http(s) URL: {}",
            source, url
        )));
    }

    info!("Classification server {} (from {})", url, source);
    Ok(url.trim_end_matches('/').to_string())
}

/// Server URL must parse, use http or https, and name a host
pub fn is_valid_server_url(url: &str) -> bool {
    url::Url::parse(url.trim())
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some())
        .unwrap_or(false)
}

/// Write configuration atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    std::fs::write(&temp_path, content)?;
    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }

    Ok(())
}
