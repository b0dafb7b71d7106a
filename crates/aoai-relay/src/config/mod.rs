use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{RelayError, Result};
use crate::proxy::ModelMap;

/// Main configuration structure for the relay
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP listener and outbound client configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Azure OpenAI resource configuration
    #[serde(default)]
    pub backend: BackendConfig,
    /// Client model name to deployment name mapping
    #[serde(default)]
    pub models: ModelMap,
    /// Inter-frame delay used when re-pacing streamed responses
    #[serde(default)]
    pub pacing: PacingConfig,
}

impl Config {
    /// Load configuration from `path`, or from the first default location that exists.
    ///
    /// Falls back to [`Config::default`] when no file is found. The result is not
    /// validated; call [`Config::validate`] before serving.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".aoai-relay").join("config.toml")),
            dirs::config_dir().map(|c| c.join("aoai-relay").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))
    }

    /// Check cross-field constraints that deserialization alone cannot express.
    pub fn validate(&self) -> Result<()> {
        self.proxy.socket_addr()?;
        self.backend.base_url()?;
        if self.backend.api_version.trim().is_empty() {
            return Err(RelayError::Config("backend.api_version must not be empty".into()));
        }
        if self.models.is_empty() {
            return Err(RelayError::Config("at least one [[models]] entry is required".into()));
        }
        if self.pacing.min_wait_ms > self.pacing.max_wait_ms {
            return Err(RelayError::Config(format!(
                "pacing.min_wait_ms ({}) exceeds pacing.max_wait_ms ({})",
                self.pacing.min_wait_ms, self.pacing.max_wait_ms
            )));
        }
        Ok(())
    }
}

/// HTTP proxy server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on (e.g., "127.0.0.1:8787")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Total deadline for non-streaming upstream calls, and for the response
    /// head of streamed ones, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Longest silence tolerated between upstream reads, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Deadline for establishing the upstream connection, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| RelayError::Config(format!("Invalid listen address: {e}")))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            timeout_secs: default_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Azure OpenAI resource configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Name of the Azure OpenAI resource; the host is `{resource_name}.openai.azure.com`
    #[serde(default)]
    pub resource_name: String,
    /// Value sent as the `api-version` query parameter on every call
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Base URL replacing `https://{resource_name}.openai.azure.com` when set
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl BackendConfig {
    /// Resolve the base URL deployments are addressed under.
    pub fn base_url(&self) -> Result<Url> {
        let raw = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None if self.resource_name.trim().is_empty() => {
                return Err(RelayError::Config(
                    "backend.resource_name or backend.endpoint must be set".into(),
                ));
            }
            None => format!("https://{}.openai.azure.com", self.resource_name.trim()),
        };

        let url = Url::parse(&raw)
            .map_err(|e| RelayError::Config(format!("Invalid backend URL '{raw}': {e}")))?;
        if url.cannot_be_a_base() || (url.scheme() != "http" && url.scheme() != "https") {
            return Err(RelayError::Config(format!(
                "Backend URL '{raw}' must be an http or https base URL"
            )));
        }
        Ok(url)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            resource_name: String::new(),
            api_version: default_api_version(),
            endpoint: None,
        }
    }
}

fn default_api_version() -> String {
    "2023-07-01-preview".to_string()
}

/// Adaptive inter-frame delay for streamed responses
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PacingConfig {
    /// Delay after frames at or above the threshold length
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,
    /// Delay after empty frames
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Frame length (in chars) at which the delay bottoms out
    #[serde(default = "default_threshold_chars")]
    pub threshold_chars: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_wait_ms: default_min_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
            threshold_chars: default_threshold_chars(),
        }
    }
}

fn default_min_wait_ms() -> u64 {
    10
}

fn default_max_wait_ms() -> u64 {
    50
}

fn default_threshold_chars() -> usize {
    1024
}
