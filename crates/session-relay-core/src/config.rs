//! Configuration management for session-relay
//!
//! Handles loading and validation of `relay.toml` configuration files. Both
//! processes read the same file shape: the origin uses `[origin]`, the peer
//! uses `[peer]`, and both share `[session]` and `[serializer]`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::serializer::{KeyRegistry, SerializerOptions, ValueKind};

/// Environment variable that overrides `session.api_key`.
pub const API_KEY_ENV: &str = "SESSION_RELAY_API_KEY";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Wire contract shared by origin and peer
    #[serde(default)]
    pub session: SessionConfig,

    /// Origin-side endpoint settings
    #[serde(default)]
    pub origin: OriginConfig,

    /// Peer-side client settings
    #[serde(default)]
    pub peer: PeerConfig,

    /// Session key registration
    #[serde(default)]
    pub serializer: SerializerConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format (pretty or json)
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file path
    #[serde(default)]
    pub log_file: Option<std::path::PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

impl GeneralConfig {
    /// Logging settings derived from this section.
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self.log_format,
            file: self.log_file.clone(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Wire contract settings. Both processes must agree on every field.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Path the origin serves the session endpoint on
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,

    /// Cookie carrying the session id
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Header carrying the shared API key
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Shared API key. This is a migration aid, not a security boundary.
    #[serde(default)]
    pub api_key: String,

    /// Header selecting read-only acquisition on GET
    #[serde(default = "default_read_only_header")]
    pub read_only_header: String,

    /// Header both sides use to announce their protocol version
    #[serde(default = "default_version_header")]
    pub version_header: String,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("endpoint_path", &self.endpoint_path)
            .field("cookie_name", &self.cookie_name)
            .field("api_key_header", &self.api_key_header)
            .field("api_key", &"<redacted>")
            .field("read_only_header", &self.read_only_header)
            .field("version_header", &self.version_header)
            .finish()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint_path: default_endpoint_path(),
            cookie_name: default_cookie_name(),
            api_key_header: default_api_key_header(),
            api_key: String::new(),
            read_only_header: default_read_only_header(),
            version_header: default_version_header(),
        }
    }
}

impl SessionConfig {
    /// Convenience constructor used by tests and embedders.
    #[must_use]
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }
}

fn default_endpoint_path() -> String {
    "/remote-session".to_string()
}

fn default_cookie_name() -> String {
    "ASP.NET_SessionId".to_string()
}

fn default_api_key_header() -> String {
    "X-Session-ApiKey".to_string()
}

fn default_read_only_header() -> String {
    "X-Session-ReadOnly".to_string()
}

fn default_version_header() -> String {
    "X-Session-Version".to_string()
}

/// Origin endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Idle timeout for sessions, which also bounds a writable lease
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    /// Interval between heartbeat bytes on a writable stream
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Maximum accepted commit body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Tell peers they may commit changesets instead of full snapshots
    #[serde(default = "default_true")]
    pub advertise_changesets: bool,

    /// Serve writable acquires over one duplex POST; answer 405 when off
    #[serde(default = "default_true")]
    pub accept_single_connection: bool,

    /// Must be `true` to bind on a non-localhost address
    #[serde(default)]
    pub allow_public_bind: bool,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            session_timeout_secs: default_session_timeout_secs(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_body_bytes: default_max_body_bytes(),
            advertise_changesets: true,
            accept_single_connection: true,
            allow_public_bind: false,
        }
    }
}

impl OriginConfig {
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// `localhost` or any loopback IP, bracketed IPv6 included.
    #[must_use]
    pub fn is_localhost(&self) -> bool {
        is_loopback_host(&self.host)
    }

    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8085
}

fn default_session_timeout_secs() -> u64 {
    20 * 60
}

fn default_heartbeat_interval_ms() -> u64 {
    20
}

fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

/// Peer client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Base URL of the origin process
    #[serde(default = "default_origin_url")]
    pub origin_url: String,

    /// Bound on header wait, first-frame read and commit round trips
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,

    /// Commit changesets when the origin advertises support
    #[serde(default = "default_true")]
    pub prefer_changesets: bool,

    /// Acquire writable sessions over one HTTP/2 POST whose request body
    /// carries the commit. Falls back to GET + PUT when the origin answers
    /// 405, or always when off.
    #[serde(default = "default_true")]
    pub use_single_connection: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            origin_url: default_origin_url(),
            network_timeout_secs: default_network_timeout_secs(),
            prefer_changesets: true,
            use_single_connection: true,
        }
    }
}

impl PeerConfig {
    #[must_use]
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }
}

fn default_origin_url() -> String {
    "http://127.0.0.1:8085".to_string()
}

fn default_network_timeout_secs() -> u64 {
    60
}

/// Session key registration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SerializerConfig {
    /// Fail on unregistered keys instead of skipping and tracking them
    #[serde(default)]
    pub throw_on_unknown_key: bool,

    /// Registered keys and their value kinds
    #[serde(default)]
    pub known_keys: BTreeMap<String, ValueKind>,
}

impl SerializerConfig {
    /// Serializer options for this section.
    #[must_use]
    pub fn options(&self, advertise_changesets: bool) -> SerializerOptions {
        let mut registry = KeyRegistry::new();
        for (key, kind) in &self.known_keys {
            registry.register(key.clone(), *kind);
        }
        SerializerOptions {
            registry,
            throw_on_unknown_key: self.throw_on_unknown_key,
            advertise_changesets,
        }
    }
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load configuration from a specific path.
    ///
    /// `SESSION_RELAY_API_KEY` overrides the file's `session.api_key`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path` when given, otherwise defaults plus env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                self.session.api_key = key;
            }
        }
    }

    /// Validate values that serde defaults cannot catch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.api_key.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "session.api_key must not be empty (or set {API_KEY_ENV})"
            )));
        }
        if !self.session.endpoint_path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "session.endpoint_path must start with '/': {}",
                self.session.endpoint_path
            )));
        }
        for (name, value) in [
            ("session.cookie_name", &self.session.cookie_name),
            ("session.api_key_header", &self.session.api_key_header),
            ("session.read_only_header", &self.session.read_only_header),
            ("session.version_header", &self.session.version_header),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must not be empty"
                )));
            }
        }
        if self.origin.session_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "origin.session_timeout_secs must be positive".to_string(),
            ));
        }
        if self.origin.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "origin.heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.peer.network_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "peer.network_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }
}

pub(crate) fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<std::net::IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
