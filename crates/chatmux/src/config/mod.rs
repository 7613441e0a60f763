use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChatmuxError, Result};

/// Environment variable naming the config file when `--config` is not given
pub const CONFIG_PATH_ENV: &str = "CHATMUX_CONFIG";

/// Main configuration structure for chatmux
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Credential pool configuration
    #[serde(default)]
    pub engine: EngineConfig,
    /// Upstream provider endpoints
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Per-user session policy
    #[serde(default)]
    pub session: SessionConfig,
    /// Streaming endpoint timing
    #[serde(default)]
    pub stream: StreamConfig,
}

impl Config {
    /// Load configuration from an explicit path, or from the first default
    /// location that exists. Falls back to defaults when nothing is found.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".chatmux").join("config.toml")),
            dirs::config_dir().map(|c| c.join("chatmux").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    /// Read and parse a single TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ChatmuxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| ChatmuxError::Config(format!("Failed to parse config: {e}")))
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Verbose logging, also propagated to every credential
    #[serde(default)]
    pub debug: bool,
}

impl ServerConfig {
    /// The `host:port` pair the listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Credential pool configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    /// Colon-delimited credential specs:
    /// `email:password[:access_token[:refresh_token]]`
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// Upstream provider endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the conversation API
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Base URL of the OAuth token endpoint
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    /// OAuth client id used for password and refresh-token grants
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Longest silence tolerated while waiting on upstream bytes, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// TCP/TLS connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_url: default_auth_url(),
            client_id: default_client_id(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://chat.openai.com/backend-api".to_string()
}

fn default_auth_url() -> String {
    "https://auth0.openai.com".to_string()
}

fn default_client_id() -> String {
    "pdlLIX2Y72MIl2rhLhTE9VV9bN905kBh".to_string()
}

fn default_timeout_secs() -> u64 {
    360
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Per-user session policy
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a session is moved to a freshly drawn credential
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl SessionConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_stale_after_secs() -> u64 {
    300
}

/// Streaming endpoint timing
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Longest wait for the next fragment before a keep-alive is sent
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Hard ceiling on a single stream, measured from its start
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl StreamConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive_secs(),
            deadline_secs: default_deadline_secs(),
        }
    }
}

fn default_keepalive_secs() -> u64 {
    12
}

fn default_deadline_secs() -> u64 {
    120
}
