//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Environment variable overriding the config file location
pub const CONFIG_PATH_VAR: &str = "EDDY_CONFIG_PATH";

/// Environment variable overriding the configured API key
pub const API_KEY_VAR: &str = "EDDY_API_KEY";

pub const DEFAULT_USER: &str = "user123";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HISTORY_LIMIT: u32 = 20;

/// Configuration for eddy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the chat service, e.g. "http://localhost/v1"
    pub base_url: Option<String>,
    /// Bearer key sent with every request
    pub api_key: Option<String>,
    /// User id the conversations belong to
    pub user: Option<String>,
    /// Connect timeout in seconds
    pub timeout_secs: Option<u64>,
    /// Number of conversations/messages fetched per list request
    pub history_limit: Option<u32>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("eddy")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        Self::load_from(Self::config_path())
    }

    fn load_from(path: PathBuf) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save config to `path`, creating parent directories
    fn save_to(&self, path: PathBuf) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        Self::init_at(Self::config_path())
    }

    fn init_at(path: PathBuf) -> std::io::Result<PathBuf> {
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            base_url: Some(eddy_api::HttpChatApi::DEFAULT_BASE_URL.to_string()),
            api_key: None,
            user: Some(DEFAULT_USER.to_string()),
            timeout_secs: Some(DEFAULT_TIMEOUT_SECS),
            history_limit: Some(DEFAULT_HISTORY_LIMIT),
        };

        default_config.save_to(path.clone())?;
        Ok(path)
    }

    /// API key from the environment, falling back to the file
    pub fn api_key(&self) -> Option<String> {
        std::env::var(API_KEY_VAR)
            .ok()
            .filter(|key| !key.is_empty())
            .or_else(|| self.api_key.clone())
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    pub fn history_limit(&self) -> u32 {
        self.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT)
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# eddy configuration file
# Place at ~/.config/eddy/config.toml (Linux), ~/Library/Application Support/eddy/config.toml (Mac)
# or %APPDATA%\eddy\config.toml (Windows). EDDY_CONFIG_PATH overrides the location.

# Base URL of the chat service
base_url = "http://localhost/v1"

# Bearer key (optional). EDDY_API_KEY takes precedence.
# api_key = "app-..."

# User id your conversations are filed under
user = "user123"

# Connect timeout in seconds. Streaming answers are never cut off.
timeout_secs = 10

# Conversations and messages fetched per list request
history_limit = 20
"#
}
