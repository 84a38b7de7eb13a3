//! Server configuration loading from file and environment variables.

use flowbridge_types::ScopeId;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
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

    /// Flow endpoint and identity resolution settings.
    #[serde(default)]
    pub flow: FlowConfig,

    /// Chat platform collaborator. Disabled unless both `base_url` and
    /// `access_token` are set.
    #[serde(default)]
    pub chat: ChatConfig,

    /// Messaging relay collaborator. Disabled unless `base_url`,
    /// `phone_number_id` and `access_token` are all set.
    #[serde(default)]
    pub relay: RelayConfig,
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
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "flowbridge_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Flow endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    /// Path to the PEM private key. Ignored when `private_key` is set.
    #[serde(default)]
    pub private_key_path: Option<String>,

    /// Inline PEM private key.
    #[serde(default)]
    pub private_key: Option<String>,

    /// Partition key for queue, mapping and submission rows.
    #[serde(default = "default_scope_id")]
    pub scope_id: ScopeId,

    /// Text shown on the success screen and relayed to the user.
    #[serde(default = "default_confirmation_message")]
    pub confirmation_message: String,

    /// Placeholder tokens that carry no per-user information.
    #[serde(default = "default_generic_tokens")]
    pub generic_tokens: Vec<String>,

    /// Token prefixes accepted by `<namespace>-<digits>-<rest>` extraction.
    /// Empty accepts any prefix.
    #[serde(default)]
    pub token_namespaces: Vec<String>,

    /// Validity window for claims made by generic-token submissions.
    #[serde(default = "default_generic_window_secs")]
    pub generic_window_secs: u64,

    /// Validity window for claims keyed by a known phone.
    #[serde(default = "default_phone_window_secs")]
    pub phone_window_secs: u64,

    /// Deadline for each cascade tier, enrichment lookup and notification.
    #[serde(default = "default_collaborator_timeout_ms")]
    pub collaborator_timeout_ms: u64,

    /// Minimum time between two queue reaps.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Entries older than this are reaped whatever their state.
    #[serde(default = "default_reap_max_age_secs")]
    pub reap_max_age_secs: u64,

    /// Consumed entries older than this are reaped.
    #[serde(default = "default_reap_consumed_age_secs")]
    pub reap_consumed_age_secs: u64,
}

/// Chat platform REST settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub account_id: i64,

    #[serde(default)]
    pub access_token: Option<String>,

    /// How many recent conversations the message scan inspects.
    #[serde(default = "default_recent_scan_limit")]
    pub recent_scan_limit: usize,
}

/// Cloud messaging relay settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub phone_number_id: Option<String>,

    #[serde(default)]
    pub access_token: Option<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "flowbridge.db".to_string()
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

fn default_scope_id() -> ScopeId {
    1
}

fn default_confirmation_message() -> String {
    "Merci pour votre retour ! Votre avis compte beaucoup pour nous.".to_string()
}

fn default_generic_tokens() -> Vec<String> {
    vec!["test".to_string(), "unused".to_string()]
}

fn default_generic_window_secs() -> u64 {
    60
}

fn default_phone_window_secs() -> u64 {
    600
}

fn default_collaborator_timeout_ms() -> u64 {
    4_000
}

fn default_reap_interval_secs() -> u64 {
    300
}

fn default_reap_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_reap_consumed_age_secs() -> u64 {
    60 * 60
}

fn default_recent_scan_limit() -> usize {
    20
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
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

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            private_key_path: None,
            private_key: None,
            scope_id: default_scope_id(),
            confirmation_message: default_confirmation_message(),
            generic_tokens: default_generic_tokens(),
            token_namespaces: Vec::new(),
            generic_window_secs: default_generic_window_secs(),
            phone_window_secs: default_phone_window_secs(),
            collaborator_timeout_ms: default_collaborator_timeout_ms(),
            reap_interval_secs: default_reap_interval_secs(),
            reap_max_age_secs: default_reap_max_age_secs(),
            reap_consumed_age_secs: default_reap_consumed_age_secs(),
        }
    }
}

impl FlowConfig {
    pub fn generic_window(&self) -> Duration {
        Duration::from_secs(self.generic_window_secs)
    }

    pub fn phone_window(&self) -> Duration {
        Duration::from_secs(self.phone_window_secs)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    /// Returns the PEM private key, inline or read from `private_key_path`.
    /// `None` when neither is configured.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::FileRead` if the key file cannot be read.
    pub fn load_private_key(&self) -> Result<Option<String>, ConfigError> {
        if let Some(pem) = self.private_key.as_ref().filter(|k| !k.trim().is_empty()) {
            // Env-provided keys often arrive with escaped newlines.
            return Ok(Some(pem.replace("\\n", "\n")));
        }
        match self.private_key_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(path) => Ok(Some(std::fs::read_to_string(path)?)),
            None => Ok(None),
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
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `FLOWBRIDGE_HOST` overrides `server.host`
/// - `FLOWBRIDGE_PORT` overrides `server.port`
/// - `FLOWBRIDGE_DB_PATH` overrides `database.path`
/// - `FLOWBRIDGE_LOG_LEVEL` overrides `logging.level`
/// - `FLOWBRIDGE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `FLOWBRIDGE_PRIVATE_KEY` overrides `flow.private_key`
/// - `FLOWBRIDGE_PRIVATE_KEY_PATH` overrides `flow.private_key_path`
/// - `FLOWBRIDGE_CHAT_TOKEN` overrides `chat.access_token`
/// - `FLOWBRIDGE_RELAY_TOKEN` overrides `relay.access_token`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
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

    // Environment variable overrides
    if let Ok(host) = std::env::var("FLOWBRIDGE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("FLOWBRIDGE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("FLOWBRIDGE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("FLOWBRIDGE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("FLOWBRIDGE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(key) = std::env::var("FLOWBRIDGE_PRIVATE_KEY") {
        config.flow.private_key = Some(key);
    }
    if let Ok(key_path) = std::env::var("FLOWBRIDGE_PRIVATE_KEY_PATH") {
        config.flow.private_key_path = Some(key_path);
    }
    if let Ok(token) = std::env::var("FLOWBRIDGE_CHAT_TOKEN") {
        config.chat.access_token = Some(token);
    }
    if let Ok(token) = std::env::var("FLOWBRIDGE_RELAY_TOKEN") {
        config.relay.access_token = Some(token);
    }

    Ok(config)
}
