//! Configuration loading and defaults.
//!
//! Precedence (highest wins): `TERMINAL_MCP_*` environment variables >
//! `--config <path>` JSON file (or `$HOME/.config/terminal-mcp/config.json`
//! if omitted) > compiled defaults. Parse failures on an environment
//! variable preserve the existing value and log a warning -- they never
//! abort startup.
//!
//! ```json
//! {
//!   "server": { "max_sessions": 50, "rate_limit_burst": 20, "rate_limit_per_minute": 600 },
//!   "session": { "default_timeout_secs": 1800, "max_background_processes": 10 },
//!   "database": { "path": "/home/user/.config/terminal-mcp/history.db" },
//!   "streaming": { "persist_stream_chunks": false },
//!   "security": { "blocked_commands": ["rm -rf /", "mkfs"] },
//!   "logging": { "level": "info", "format": "text" },
//!   "monitoring": { "sample_interval_secs": 5 }
//! }
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Top-level configuration, deserialized from JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub database: DatabaseConfig,
    pub streaming: StreamingConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            database: DatabaseConfig::default(),
            streaming: StreamingConfig::default(),
            security: SecurityConfig::default(),
            logging: LoggingConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum number of live sessions (default 50).
    pub max_sessions: usize,
    /// Token-bucket burst capacity for inbound tool calls (default 20).
    pub rate_limit_burst: u32,
    /// Token-bucket refill rate, tokens per minute (default 600).
    pub rate_limit_per_minute: u32,
    /// Whether debug-level logging/server flags are forced on (default false).
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            rate_limit_burst: 20,
            rate_limit_per_minute: 600,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default foreground command timeout in seconds (default 300, max enforced at 300 per tool).
    pub default_timeout_secs: u64,
    /// Maximum concurrent background processes per session (default 10).
    pub max_background_processes: usize,
    /// Maximum history rows retained per session (default 200).
    pub max_commands_per_session: usize,
    /// Grace period between SIGTERM and SIGKILL during graceful termination (default 5s).
    pub termination_grace_period_secs: u64,
    /// Ceiling for each Output Buffer, in bytes (default 1 MiB).
    pub output_buffer_max_length: usize,
    /// Interval between inactive-session cleanup passes (default 60s).
    pub cleanup_interval_secs: u64,
    /// Interval between resource-cleanup passes (default 300s).
    pub resource_cleanup_interval_secs: u64,
    /// Maximum CPU percentage a single command may be allotted, used only for validation (default 100).
    pub max_cpu_percent: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            max_background_processes: 10,
            max_commands_per_session: 200,
            termination_grace_period_secs: 5,
            output_buffer_max_length: 1024 * 1024,
            cleanup_interval_secs: 60,
            resource_cleanup_interval_secs: 300,
            max_cpu_percent: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file. Empty means "alongside config.json".
    pub path: String,
    /// Maximum pool connections (default 5).
    pub max_connections: u32,
    /// SQLite busy-wait timeout in milliseconds (default 5000).
    pub busy_timeout_ms: u64,
    /// Whether the store is enabled at all (default true; false runs fully in-memory).
    pub enabled: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            max_connections: 5,
            busy_timeout_ms: 5000,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Whether interleaved stdout/stderr/status chunks are persisted per-command.
    pub persist_stream_chunks: bool,
    /// How long persisted stream chunks are retained before cleanup (default 24h).
    pub stream_chunk_retention_hours: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            persist_stream_chunks: false,
            stream_chunk_retention_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Literal substrings that cause a command to be rejected with `CommandBlocked`.
    pub blocked_commands: Vec<String>,
    /// Hard ceiling on any command's timeout, in seconds (default 3600).
    pub max_timeout_seconds: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            blocked_commands: default_blocked_commands(),
            max_timeout_seconds: 3600,
        }
    }
}

fn default_blocked_commands() -> Vec<String> {
    vec![
        "rm -rf /".to_string(),
        "mkfs".to_string(),
        ":(){ :|:& };:".to_string(),
        "shutdown".to_string(),
        "curl | bash".to_string(),
        "curl | sh".to_string(),
        "> /dev/sda".to_string(),
    ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of `debug`, `info`, `warn`, `error` (default `info`).
    pub level: String,
    /// One of `json`, `text` (default `text`).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Interval between resource samples in seconds (default 10).
    pub sample_interval_secs: u64,
    /// Number of samples retained in the sliding window (default 1000).
    pub sample_window: usize,
    /// Task-count growth over baseline that triggers a leak warning (default 100).
    pub task_count_threshold: u64,
    /// Memory growth over baseline, in MB, that triggers a leak warning (default 200).
    pub memory_threshold_mb: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 10,
            sample_window: 1000,
            task_count_threshold: 100,
            memory_threshold_mb: 200,
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file and fails loudly on parse error
    /// (a bad `--config` argument is a fatal startup error, exit code `1`).
    /// If `path` is `None`, the default config directory's `config.json` is
    /// used when present; otherwise compiled defaults apply.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", p.display()))?;
                serde_json::from_str(&content)
                    .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", p.display()))?
            }
            None => {
                let default_path = config_dir().join("config.json");
                if default_path.exists() {
                    let content = std::fs::read_to_string(&default_path)?;
                    serde_json::from_str(&content)?
                } else {
                    Config::default()
                }
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `TERMINAL_MCP_*` environment variable overrides. A present but
    /// unparseable value is ignored (default/file value retained) with a
    /// warning logged.
    fn apply_env_overrides(&mut self) {
        apply_usize_env("TERMINAL_MCP_MAX_SESSIONS", &mut self.server.max_sessions);
        apply_u32_env("TERMINAL_MCP_RATE_LIMIT_BURST", &mut self.server.rate_limit_burst);
        apply_u32_env(
            "TERMINAL_MCP_RATE_LIMIT_PER_MINUTE",
            &mut self.server.rate_limit_per_minute,
        );
        apply_bool_env("TERMINAL_MCP_DEBUG", &mut self.server.debug);

        apply_u64_env(
            "TERMINAL_MCP_DEFAULT_TIMEOUT_SECS",
            &mut self.session.default_timeout_secs,
        );
        apply_usize_env(
            "TERMINAL_MCP_MAX_BACKGROUND_PROCESSES",
            &mut self.session.max_background_processes,
        );
        apply_usize_env(
            "TERMINAL_MCP_MAX_COMMANDS_PER_SESSION",
            &mut self.session.max_commands_per_session,
        );

        apply_string_env("TERMINAL_MCP_DATABASE_PATH", &mut self.database.path);
        apply_bool_env("TERMINAL_MCP_DATABASE_ENABLED", &mut self.database.enabled);

        apply_string_env("TERMINAL_MCP_LOG_LEVEL", &mut self.logging.level);
        apply_string_env("TERMINAL_MCP_LOG_FORMAT", &mut self.logging.format);
    }

    /// Validate the loaded configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("server.max_sessions", self.server.max_sessions as i64),
            ("session.max_background_processes", self.session.max_background_processes as i64),
            ("session.max_commands_per_session", self.session.max_commands_per_session as i64),
            ("session.cleanup_interval_secs", self.session.cleanup_interval_secs as i64),
            (
                "session.resource_cleanup_interval_secs",
                self.session.resource_cleanup_interval_secs as i64,
            ),
            ("database.max_connections", self.database.max_connections as i64),
            ("monitoring.sample_interval_secs", self.monitoring.sample_interval_secs as i64),
        ] {
            if value <= 0 {
                anyhow::bail!("{name} must be > 0, got {value}");
            }
        }

        if !(1..=100).contains(&self.session.max_cpu_percent) {
            anyhow::bail!(
                "session.max_cpu_percent must be in [1, 100], got {}",
                self.session.max_cpu_percent
            );
        }

        if !matches!(self.logging.level.as_str(), "debug" | "info" | "warn" | "error") {
            anyhow::bail!("logging.level must be one of debug,info,warn,error, got '{}'", self.logging.level);
        }

        if !matches!(self.logging.format.as_str(), "json" | "text") {
            anyhow::bail!("logging.format must be one of json,text, got '{}'", self.logging.format);
        }

        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.session.default_timeout_secs)
    }

    pub fn termination_grace_period(&self) -> Duration {
        Duration::from_secs(self.session.termination_grace_period_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.session.cleanup_interval_secs)
    }

    pub fn resource_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.session.resource_cleanup_interval_secs)
    }

    /// Resolve the path used for the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        if self.database.path.is_empty() {
            config_dir().join("history.db")
        } else {
            PathBuf::from(&self.database.path)
        }
    }
}

/// `$HOME/.config/terminal-mcp/`, the default config and state directory.
#[must_use]
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("terminal-mcp")
}

fn apply_string_env(var: &str, field: &mut String) {
    if let Ok(val) = std::env::var(var) {
        *field = val;
    }
}

fn apply_bool_env(var: &str, field: &mut bool) {
    if let Ok(val) = std::env::var(var) {
        match val.parse::<bool>() {
            Ok(parsed) => *field = parsed,
            Err(_) => warn!(var, value = %val, "ignoring unparseable boolean env override"),
        }
    }
}

fn apply_u32_env(var: &str, field: &mut u32) {
    if let Ok(val) = std::env::var(var) {
        match val.parse::<u32>() {
            Ok(parsed) => *field = parsed,
            Err(_) => warn!(var, value = %val, "ignoring unparseable integer env override"),
        }
    }
}

fn apply_u64_env(var: &str, field: &mut u64) {
    if let Ok(val) = std::env::var(var) {
        match val.parse::<u64>() {
            Ok(parsed) => *field = parsed,
            Err(_) => warn!(var, value = %val, "ignoring unparseable integer env override"),
        }
    }
}

fn apply_usize_env(var: &str, field: &mut usize) {
    if let Ok(val) = std::env::var(var) {
        match val.parse::<usize>() {
            Ok(parsed) => *field = parsed,
            Err(_) => warn!(var, value = %val, "ignoring unparseable integer env override"),
        }
    }
}
