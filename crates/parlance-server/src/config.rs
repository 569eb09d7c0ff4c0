//! Server configuration loading from file and environment variables.

use parlance_agent::AgentConfig;
use parlance_voice::{AsrConfig, TtsConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-session lock settings.
    #[serde(default)]
    pub lock: LockConfig,

    /// Turn streaming settings.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Speech synthesis settings.
    #[serde(default)]
    pub voice: VoiceConfig,

    /// Audio clip storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Upstream agent settings.
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally visible base URL prepended to audio links. Empty yields
    /// server-relative links.
    #[serde(default)]
    pub public_url: String,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "parlance_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Where session locks live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackendKind {
    /// Shared through the database; safe across several server processes.
    #[default]
    Sqlite,
    /// Process-local.
    Memory,
}

/// Session lock configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default)]
    pub backend: LockBackendKind,

    /// Seconds after which an abandoned lock may be taken over.
    #[serde(default = "default_lock_ttl_seconds")]
    pub ttl_seconds: u64,
}

/// Turn streaming configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Minimum characters before a fragment may be flushed to synthesis.
    #[serde(default = "default_segment_min_len")]
    pub segment_min_len: usize,

    /// Length at which a fragment is flushed even without a terminal mark.
    #[serde(default = "default_segment_max_len")]
    pub segment_max_len: usize,

    /// Hold every event of a turn until the turn is committed.
    #[serde(default)]
    pub deliver_after_commit: bool,

    /// Number of messages returned by the history listing.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

/// Speech synthesis and recognition configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceConfig {
    #[serde(flatten)]
    pub tts: TtsConfig,

    /// Recognition backend for spoken user input, under `[voice.asr]`.
    #[serde(default)]
    pub asr: AsrConfig,

    /// Spoken notices per tool name, merged over the built-in ones.
    #[serde(default)]
    pub tool_prompts: HashMap<String, String>,
}

impl VoiceConfig {
    /// Recognition settings with the synthesis key filled in when no
    /// separate key is configured.
    pub fn resolved_asr(&self) -> AsrConfig {
        let mut asr = self.asr.clone();
        if asr.api_key.is_empty() {
            asr.api_key = self.tts.api_key.clone();
        }
        asr
    }
}

/// Audio clip storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding stored clips.
    #[serde(default = "default_storage_dir")]
    pub dir: String,

    /// Route prefix the directory is served under.
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "parlance.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_lock_ttl_seconds() -> u64 {
    60
}

fn default_segment_min_len() -> usize {
    10
}

fn default_segment_max_len() -> usize {
    40
}

fn default_history_limit() -> u32 {
    100
}

fn default_storage_dir() -> String {
    "data/audio".to_string()
}

fn default_url_prefix() -> String {
    "/audio".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: String::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackendKind::default(),
            ttl_seconds: default_lock_ttl_seconds(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            segment_min_len: default_segment_min_len(),
            segment_max_len: default_segment_max_len(),
            deliver_after_commit: false,
            history_limit: default_history_limit(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
            url_prefix: default_url_prefix(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values parsed but do not make sense together.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.segment_min_len == 0 {
            return Err(ConfigError::Invalid(
                "stream.segment_min_len must be at least 1".to_string(),
            ));
        }
        if self.stream.segment_max_len < self.stream.segment_min_len {
            return Err(ConfigError::Invalid(
                "stream.segment_max_len must not be below stream.segment_min_len".to_string(),
            ));
        }
        if self.lock.ttl_seconds == 0 {
            return Err(ConfigError::Invalid(
                "lock.ttl_seconds must be positive".to_string(),
            ));
        }
        if !self.storage.url_prefix.starts_with('/') || self.storage.url_prefix.len() < 2 {
            return Err(ConfigError::Invalid(
                "storage.url_prefix must be a non-root path such as /audio".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PARLANCE_HOST` overrides `server.host`
/// - `PARLANCE_PORT` overrides `server.port`
/// - `PARLANCE_DB_PATH` overrides `database.path`
/// - `PARLANCE_LOG_LEVEL` overrides `logging.level`
/// - `PARLANCE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `PARLANCE_TTS_API_KEY` overrides `voice.api_key`
/// - `PARLANCE_ASR_API_KEY` overrides `voice.asr.api_key`
/// - `PARLANCE_AGENT_API_KEY` overrides `agent.api_key`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting values are inconsistent.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    let config = apply_env_overrides(config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(mut config: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(host) = var("PARLANCE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("PARLANCE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("PARLANCE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("PARLANCE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("PARLANCE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(key) = var("PARLANCE_TTS_API_KEY") {
        config.voice.tts.api_key = key;
    }
    if let Some(key) = var("PARLANCE_ASR_API_KEY") {
        config.voice.asr.api_key = key;
    }
    if let Some(key) = var("PARLANCE_AGENT_API_KEY") {
        config.agent.api_key = key;
    }
    config
}
