use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Port the JSON-RPC service listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 8081;

/// Top-level configuration loaded from `~/.hybrid-bridge/config.toml`.
///
/// Every section and field has a default, so an empty or missing file yields
/// a working configuration. Environment overrides are applied separately by
/// [`Config::apply_env_overrides`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub data: DataConfig,
}

impl Config {
    /// Load config from the default path, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply overrides from an environment lookup (`FOUNDRY_LOCAL_URL`,
    /// `HB_PORT`, `HB_TUNNEL_EXECUTABLE`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("FOUNDRY_LOCAL_URL").filter(|v| !v.trim().is_empty()) {
            self.model.base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(port) = lookup("HB_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Validation(format!("HB_PORT is not a port: {port}")))?;
        }
        if let Some(exe) = lookup("HB_TUNNEL_EXECUTABLE").filter(|v| !v.trim().is_empty()) {
            self.tunnel.executable = exe;
        }
        self.validate()
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::Validation("server.name must not be empty".into()));
        }
        if self.tunnel.executable.trim().is_empty() {
            return Err(ConfigError::Validation(
                "tunnel.executable must not be empty".into(),
            ));
        }
        if self.tunnel.startup_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "tunnel.startup_timeout_secs must be > 0".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ConfigError::Validation(format!(
                "model.temperature out of range: {}",
                self.model.temperature
            )));
        }
        if !self.model.base_url.starts_with("http://") && !self.model.base_url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "model.base_url must be an http(s) URL: {}",
                self.model.base_url
            )));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hybrid-bridge")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_server_version")]
    pub version: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// How long `stop()` waits for in-flight requests before detaching.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: default_port(),
            name: default_server_name(),
            version: default_server_version(),
            protocol_version: default_protocol_version(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_bind_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_server_name() -> String {
    "LocalMedicalContextServer".into()
}
fn default_server_version() -> String {
    "1.0.0".into()
}
fn default_protocol_version() -> String {
    "2025-06-18".into()
}
fn default_shutdown_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Start the tunnel together with the service.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tunnel_executable")]
    pub executable: String,
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
    #[serde(default = "default_login_probe_timeout_secs")]
    pub login_probe_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            executable: default_tunnel_executable(),
            allow_anonymous: true,
            startup_timeout_secs: default_startup_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            join_timeout_secs: default_join_timeout_secs(),
            login_probe_timeout_secs: default_login_probe_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_tunnel_executable() -> String {
    "devtunnel".into()
}
fn default_startup_timeout_secs() -> u64 {
    30
}
fn default_stop_timeout_secs() -> u64 {
    5
}
fn default_join_timeout_secs() -> u64 {
    2
}
fn default_login_probe_timeout_secs() -> u64 {
    10
}

/// OpenAI-compatible local inference endpoint used by the tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_base_url")]
    pub base_url: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_model_base_url(),
            model_id: default_model_id(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

impl ModelConfig {
    pub fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_model_base_url() -> String {
    "http://127.0.0.1:5273".into()
}
fn default_model_id() -> String {
    "phi-4-mini-instruct-vitis-npu:2".into()
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.2
}
fn default_model_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding the patient record JSON files.
    #[serde(default = "default_data_dir")]
    pub dir: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "medical/data".into()
}
