//! Client configuration.

use crate::{AuthError, AuthResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default API base URL (can be overridden at compile time via the
/// VERSECRAFT_API_URL env var).
pub const DEFAULT_API_URL: &str = match option_env!("VERSECRAFT_API_URL") {
    Some(url) => url,
    None => "https://api.versecraft.app",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Fixed per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Main client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Maximum attempts for retryable operations.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Initial retry delay in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Retry delay cap in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            api_url: default_api_url(),
            request_timeout_secs: default_request_timeout(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from
    /// environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from a JSON file, falling back to defaults for
    /// anything missing. Environment variables are applied last.
    pub fn load(path: &Path) -> AuthResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| AuthError::Config(format!("Failed to read config: {e}")))?;
            serde_json::from_str(&content)?
        } else {
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> AuthResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AuthError::Config(format!("Failed to create config dir: {e}")))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| AuthError::Config(format!("Failed to write config: {e}")))?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("VERSECRAFT_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(api_url) = std::env::var("VERSECRAFT_API_URL") {
            if !api_url.trim().is_empty() {
                self.api_url = api_url.trim_end_matches('/').to_string();
            }
        }
    }

    /// Per-request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
