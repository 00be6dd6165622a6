//! Configuration management for Parley.
//!
//! The gateway reads a single JSON file at `~/.parley/config.json`
//! (or the path in `PARLEY_CONFIG`) once at startup.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `PASSWORD` → auth.password
//! - `HOST` → network.host
//! - `PORT` → network.port
//! - `PARLEY_API_URL` → upstream.endpoint
//! - `PARLEY_API_KEY` (or `OPENAI_API_KEY`) → upstream.api_key
//! - `PARLEY_LOG_LEVEL` → observability.log_level
//! - `PARLEY_LOG_FORMAT` → observability.log_format

use crate::error::{Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".parley"),
        |dirs| dirs.home_dir().join(".parley"),
    )
}

/// Get the configuration file path, honouring `PARLEY_CONFIG`.
pub fn config_path() -> PathBuf {
    std::env::var("PARLEY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("config.json"))
}

// ============================================================================
// Network
// ============================================================================

/// Listen address for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

// ============================================================================
// Auth
// ============================================================================

/// Shared-secret gate in front of every conversation route.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// The password embedded as the first path segment. Required.
    #[serde(default)]
    pub password: Option<String>,
}

// ============================================================================
// Upstream
// ============================================================================

/// Chat-completion endpoint the gateway forwards to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Full URL that receives the completion POST
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bearer credential; no Authorization header is sent when absent
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-attempt timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_endpoint() -> String {
    "https://chatgpt-api.shn.hk/v1/".into()
}

fn default_timeout_secs() -> u64 {
    30
}

// ============================================================================
// Retry
// ============================================================================

/// Retry behaviour when the upstream answers with a throttling status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per reply, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between throttled attempts
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

fn default_max_attempts() -> u32 {
    8
}

fn default_backoff_secs() -> u64 {
    3
}

// ============================================================================
// Rate limiting
// ============================================================================

/// Minimum interval between requests, per client and endpoint class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_general_ms")]
    pub general_ms: u64,

    #[serde(default = "default_debug_ms")]
    pub debug_ms: u64,

    #[serde(default = "default_api_ms")]
    pub api_ms: u64,

    /// Fingerprints idle for longer than this are forgotten
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            general_ms: default_general_ms(),
            debug_ms: default_debug_ms(),
            api_ms: default_api_ms(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_general_ms() -> u64 {
    500
}

fn default_debug_ms() -> u64 {
    1_000
}

fn default_api_ms() -> u64 {
    5_000
}

fn default_stale_after_secs() -> u64 {
    3_600
}

// ============================================================================
// Sessions
// ============================================================================

/// Conversation retention and size limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Conversations untouched for this long are evicted
    #[serde(default = "default_dormant_after_secs")]
    pub dormant_after_secs: u64,

    /// Period of the background sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Soft cap on retained messages per conversation
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Largest count a single truncate call may remove
    #[serde(default = "default_max_truncate")]
    pub max_truncate: usize,

    /// Longest accepted message body, in characters
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    /// Model used when a request does not name one
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            dormant_after_secs: default_dormant_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_messages: default_max_messages(),
            max_truncate: default_max_truncate(),
            max_content_chars: default_max_content_chars(),
            default_model: default_model(),
        }
    }
}

fn default_dormant_after_secs() -> u64 {
    43_200
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_max_messages() -> usize {
    500
}

fn default_max_truncate() -> usize {
    50
}

fn default_max_content_chars() -> usize {
    20_000
}

fn default_model() -> String {
    "gpt-3.5-turbo".into()
}

// ============================================================================
// Observability
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
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
    "pretty".into()
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .context(format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup("PASSWORD") {
            self.auth.password = Some(password);
        }
        if let Some(host) = lookup("HOST") {
            self.network.host = host;
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(p) => self.network.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring unparsable PORT"),
            }
        }
        if let Some(endpoint) = lookup("PARLEY_API_URL") {
            self.upstream.endpoint = endpoint;
        }
        if let Some(key) = lookup("PARLEY_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.upstream.api_key = Some(key);
        }
        if let Some(level) = lookup("PARLEY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("PARLEY_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Address string for the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }
}
