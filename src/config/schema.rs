//! TOML configuration for the gateway core.
//!
//! Loaded from `<state_dir>/config.toml`; every section has serde defaults
//! so a missing or partial file yields a working configuration. The state
//! directory is `$STATE_DIR` when set, else `$HOME/.clawdbot`.

use crate::gateway::rate_limit::RateLimitConfig;
use crate::tools::PermissionMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Computed at load time, never serialized.
    #[serde(skip)]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub permissions: PermissionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Browser origins accepted on upgrade, besides the always-allowed
    /// local and mesh hosts. Literal entries or `*.domain` wildcards.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Shared token required in the first frame of every connection.
    /// Unset means no handshake (loopback deployments).
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub allow_public_bind: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
            auth_token: None,
            allow_public_bind: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_max_connections")]
    pub max_connections_per_minute: u32,
    #[serde(default = "default_max_rpc")]
    pub max_rpc_per_second: u32,
    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: u32,
    #[serde(default = "default_auth_window_ms")]
    pub auth_window_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_connections_per_minute: default_max_connections(),
            max_rpc_per_second: default_max_rpc(),
            max_auth_failures: default_max_auth_failures(),
            auth_window_ms: default_auth_window_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl RateLimitSettings {
    /// Convert the serialized millisecond knobs into limiter durations.
    pub fn to_runtime(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_connections: self.max_connections_per_minute,
            connection_window: Duration::from_secs(60),
            max_rpc_calls: self.max_rpc_per_second,
            rpc_window: Duration::from_secs(1),
            max_auth_failures: self.max_auth_failures,
            auth_window: Duration::from_millis(self.auth_window_ms),
            cleanup_interval: Duration::from_millis(self.cleanup_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Encrypt transcripts at rest. The `SESSION_ENCRYPTION` env var
    /// (`off`/`false`/`0`) wins over this setting.
    #[serde(default = "default_true")]
    pub encryption: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { encryption: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Startup permission mode: plan, ask, auto, or dangerously-skip.
    #[serde(default = "default_mode")]
    pub mode: String,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
        }
    }
}

impl PermissionsConfig {
    pub fn parsed_mode(&self) -> PermissionMode {
        PermissionMode::parse(&self.mode).unwrap_or_default()
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18789
}

fn default_max_connections() -> u32 {
    10
}

fn default_max_rpc() -> u32 {
    100
}

fn default_max_auth_failures() -> u32 {
    5
}

fn default_auth_window_ms() -> u64 {
    300_000
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_mode() -> String {
    "auto".to_string()
}

impl Config {
    /// Resolve the state directory: `$STATE_DIR`, else `$HOME/.clawdbot`.
    pub fn state_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("STATE_DIR") {
            return PathBuf::from(dir);
        }
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".clawdbot");
        }
        directories::UserDirs::new()
            .map(|d| d.home_dir().join(".clawdbot"))
            .unwrap_or_else(|| PathBuf::from(".clawdbot"))
    }

    /// Load `<state_dir>/config.toml`, or defaults when it does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::state_dir())
    }

    pub fn load_from(state_dir: PathBuf) -> Result<Self> {
        let path = state_dir.join("config.toml");
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Config::default()
        };
        config.state_dir = state_dir;
        Ok(config)
    }
}
