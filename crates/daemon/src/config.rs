//! Configuration management for the shellbridge daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellbridge/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default Matrix homeserver.
pub const DEFAULT_HOMESERVER: &str = "https://matrix.org";

/// Default token that sends an interrupt (Ctrl-C) to the shell.
pub const DEFAULT_INTERRUPT_TOKEN: &str = "!ctrlc";

/// Default token that sends end-of-file (Ctrl-D) to the shell.
pub const DEFAULT_EOF_TOKEN: &str = "!ctrld";

/// Default quiet window before buffered output is flushed.
pub const DEFAULT_QUIET_WINDOW_MS: u64 = 100;

/// Default delay between reconnection attempts.
pub const DEFAULT_RECONNECT_BACKOFF_SECS: u64 = 5;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("homeserver must start with http:// or https://, got {0}")]
    InvalidHomeserver(String),

    #[error("user_id is required for the matrix transport")]
    MissingUserId,

    #[error("either password or access_token is required for the matrix transport")]
    MissingCredentials,

    #[error("allowed_senders must contain at least one sender")]
    NoAllowedSenders,

    #[error("shell command not found: {0}")]
    InvalidShellPath(String),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("quiet_window_ms must be between 10 and 10000, got {0}")]
    InvalidQuietWindow(u64),

    #[error("max_message_bytes must be at least 64, got {0}")]
    InvalidMaxMessageBytes(usize),

    #[error("require_prefix is set but no prefix is configured")]
    MissingPrefix,

    #[error("control tokens must not be empty")]
    EmptyControlToken,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the shellbridge daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Chat transport configuration.
    pub transport: TransportConfig,

    /// Local console transport settings.
    pub console: ConsoleConfig,

    /// Shell process configuration.
    pub shell: ShellConfig,

    /// Sender authorization.
    pub auth: AuthConfig,

    /// Command grammar for inbound messages.
    pub input: InputConfig,

    /// Output batching and rendering.
    pub output: OutputConfig,

    /// Connection lifecycle settings.
    pub bridge: BridgeConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional file to write logs to instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Which chat backend to bridge to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Matrix client-server API.
    #[default]
    Matrix,
    /// Local stdin/stdout.
    Console,
}

/// Chat transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Backend to use.
    pub kind: TransportKind,

    /// Homeserver base URL.
    pub homeserver: String,

    /// Account to log in as (e.g. `@shell:example.org`).
    pub user_id: String,

    /// Password for `m.login.password`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Pre-issued access token; skips the login request when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Display name for the device created at login.
    pub device_name: String,

    /// Server-side long-poll timeout for sync requests.
    pub sync_timeout_secs: u64,

    /// Client-side timeout for regular requests.
    pub request_timeout_secs: u64,
}

/// Local console transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Sender identity attached to lines read from stdin.
    pub sender: String,
}

/// Shell process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell executable.
    pub command: String,

    /// Arguments passed to the shell.
    pub args: Vec<String>,

    /// Working directory for the shell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Terminal width in columns.
    pub cols: u16,

    /// Terminal height in rows.
    pub rows: u16,

    /// Additional environment variables.
    pub env: BTreeMap<String, String>,
}

/// Sender authorization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Senders allowed to write to the shell.
    pub allowed_senders: Vec<String>,

    /// Join rooms when an allowed sender invites the bridge.
    pub admit_invites: bool,
}

/// Command grammar for inbound messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InputConfig {
    /// Only messages starting with `prefix` are forwarded.
    pub require_prefix: bool,

    /// Prefix stripped from commands (e.g. `$ `).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Message that sends Ctrl-C.
    pub interrupt_token: String,

    /// Message that sends Ctrl-D.
    pub eof_token: String,
}

/// Output batching and rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Idle time after which buffered output is sent.
    pub quiet_window_ms: u64,

    /// Longest message sent in one piece; longer output is split.
    pub max_message_bytes: usize,

    /// Attach a preformatted HTML body to each message.
    pub html: bool,
}

/// Connection lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Fixed delay before reconnecting after a transport failure.
    pub reconnect_backoff_secs: u64,

    /// Rooms joined at startup and added to the broadcast set.
    pub rooms: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Matrix,
            homeserver: DEFAULT_HOMESERVER.to_string(),
            user_id: String::new(),
            password: None,
            access_token: None,
            device_name: "shellbridge".to_string(),
            sync_timeout_secs: 30,
            request_timeout_secs: 10,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            sender: "local".to_string(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: default_shell(),
            args: Vec::new(),
            cwd: None,
            cols: 80,
            rows: 24,
            env: BTreeMap::new(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allowed_senders: Vec::new(),
            admit_invites: true,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            require_prefix: false,
            prefix: None,
            interrupt_token: DEFAULT_INTERRUPT_TOKEN.to_string(),
            eof_token: DEFAULT_EOF_TOKEN.to_string(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            quiet_window_ms: DEFAULT_QUIET_WINDOW_MS,
            max_message_bytes: 16 * 1024,
            html: true,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_secs: DEFAULT_RECONNECT_BACKOFF_SECS,
            rooms: Vec::new(),
        }
    }
}

impl OutputConfig {
    /// Quiet window as a [`Duration`].
    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }
}

impl BridgeConfig {
    /// Reconnect backoff as a [`Duration`].
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellbridge")
        .join("config.toml")
}

/// Returns the default shell: `$SHELL`, or `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Reads a non-empty environment variable.
fn env_override(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values; empty
    /// values are ignored. Supported variables:
    /// - SHELLBRIDGE_HOMESERVER
    /// - SHELLBRIDGE_USER
    /// - SHELLBRIDGE_PASSWORD
    /// - SHELLBRIDGE_ACCESS_TOKEN
    /// - SHELLBRIDGE_LOG_LEVEL
    ///
    /// Returns the names of the variables that were applied, so they can be
    /// logged once tracing is initialized.
    pub fn apply_env_overrides(&mut self) -> Vec<&'static str> {
        let mut applied = Vec::new();

        if let Some(url) = env_override("SHELLBRIDGE_HOMESERVER") {
            self.transport.homeserver = url;
            applied.push("SHELLBRIDGE_HOMESERVER");
        }

        if let Some(user) = env_override("SHELLBRIDGE_USER") {
            self.transport.user_id = user;
            applied.push("SHELLBRIDGE_USER");
        }

        if let Some(password) = env_override("SHELLBRIDGE_PASSWORD") {
            self.transport.password = Some(password);
            applied.push("SHELLBRIDGE_PASSWORD");
        }

        if let Some(token) = env_override("SHELLBRIDGE_ACCESS_TOKEN") {
            self.transport.access_token = Some(token);
            applied.push("SHELLBRIDGE_ACCESS_TOKEN");
        }

        if let Some(level) = env_override("SHELLBRIDGE_LOG_LEVEL") {
            self.daemon.log_level = level;
            applied.push("SHELLBRIDGE_LOG_LEVEL");
        }

        applied
    }

    /// Validate the configuration values.
    ///
    /// Transport credentials and the allow-list are only required for the
    /// Matrix transport; the console sender is always authorized.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.transport.kind == TransportKind::Matrix {
            let url = &self.transport.homeserver;
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidHomeserver(url.clone()));
            }

            if self.transport.access_token.is_none() {
                if self.transport.user_id.is_empty() {
                    return Err(ConfigError::MissingUserId);
                }
                if self.transport.password.is_none() {
                    return Err(ConfigError::MissingCredentials);
                }
            }

            if self.auth.allowed_senders.is_empty() {
                return Err(ConfigError::NoAllowedSenders);
            }
        }

        // Absolute paths must exist; bare names are looked up in PATH
        let shell_path = Path::new(&self.shell.command);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.shell.command).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(self.shell.command.clone()));
        }

        if self.shell.cols == 0 || self.shell.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.shell.cols,
                rows: self.shell.rows,
            });
        }

        if !(10..=10_000).contains(&self.output.quiet_window_ms) {
            return Err(ConfigError::InvalidQuietWindow(self.output.quiet_window_ms));
        }

        if self.output.max_message_bytes < 64 {
            return Err(ConfigError::InvalidMaxMessageBytes(
                self.output.max_message_bytes,
            ));
        }

        let has_prefix = self.input.prefix.as_deref().is_some_and(|p| !p.is_empty());
        if self.input.require_prefix && !has_prefix {
            return Err(ConfigError::MissingPrefix);
        }

        if self.input.interrupt_token.is_empty() || self.input.eof_token.is_empty() {
            return Err(ConfigError::EmptyControlToken);
        }

        Ok(())
    }

    /// Returns a copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.transport.password.is_some() {
            copy.transport.password = Some("********".to_string());
        }
        if copy.transport.access_token.is_some() {
            copy.transport.access_token = Some("********".to_string());
        }
        copy
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
