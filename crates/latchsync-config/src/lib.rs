//! Host-side configuration for latchsync.
//!
//! TOML file + environment loading via `figment`, validation and
//! translation to `latchsync_core::SyncConfig`, platform directory
//! resolution, push credential lookup, and tracing subscriber setup.

mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use latchsync_core::{RetryPolicy, SyncConfig};

pub use logging::init_tracing;

const ENV_PREFIX: &str = "LATCHSYNC_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("logging setup failed: {message}")]
    Logging { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub dispatch: DispatchSettings,

    #[serde(default)]
    pub push: PushSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Durable cache location and what goes in it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheSettings {
    /// Cache root. Defaults to the platform cache directory.
    pub dir: Option<PathBuf>,

    /// Persist reconciled snapshots across restarts.
    #[serde(default = "default_true")]
    pub persist_snapshots: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: None,
            persist_snapshots: true,
        }
    }
}

/// Dispatcher tuning. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DispatchSettings {
    #[serde(default = "default_effect_timeout_ms")]
    pub effect_timeout_ms: u64,

    /// Total effect invocations per operation, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_event_channel_size")]
    pub event_channel_size: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            effect_timeout_ms: default_effect_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            event_channel_size: default_event_channel_size(),
        }
    }
}

/// Real-time push channel endpoint and reconnect policy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PushSettings {
    /// WebSocket URL (`ws://` or `wss://`). Push is disabled when unset.
    pub url: Option<String>,

    /// Environment variable holding the bearer token.
    pub token_env: Option<String>,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Give up after this many consecutive failures (`None` retries forever).
    pub max_retries: Option<u32>,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            url: None,
            token_env: None,
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// Log to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_effect_timeout_ms() -> u64 {
    15_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_event_channel_size() -> usize {
    256
}
fn default_reconnect_initial_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_level() -> String {
    "info".into()
}

// ── Validation & translation ────────────────────────────────────────

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dispatch;
        if d.effect_timeout_ms == 0 {
            return Err(invalid("dispatch.effect_timeout_ms", "must be greater than zero"));
        }
        if d.max_attempts == 0 {
            return Err(invalid("dispatch.max_attempts", "must be at least 1"));
        }
        if d.initial_backoff_ms > d.max_backoff_ms {
            return Err(invalid(
                "dispatch.initial_backoff_ms",
                format!(
                    "{} exceeds max_backoff_ms ({})",
                    d.initial_backoff_ms, d.max_backoff_ms
                ),
            ));
        }
        if d.event_channel_size == 0 {
            return Err(invalid("dispatch.event_channel_size", "must be greater than zero"));
        }

        let p = &self.push;
        if p.reconnect_initial_ms > p.reconnect_max_ms {
            return Err(invalid(
                "push.reconnect_initial_ms",
                "exceeds push.reconnect_max_ms",
            ));
        }
        self.push_url()?;

        logging::parse_filter(&self.logging.level)?;
        Ok(())
    }

    /// Validate and build the core's runtime configuration.
    pub fn to_sync_config(&self) -> Result<SyncConfig, ConfigError> {
        self.validate()?;
        let d = &self.dispatch;
        Ok(SyncConfig {
            effect_timeout: Duration::from_millis(d.effect_timeout_ms),
            retry: RetryPolicy {
                max_attempts: d.max_attempts,
                initial_delay: Duration::from_millis(d.initial_backoff_ms),
                max_delay: Duration::from_millis(d.max_backoff_ms),
            },
            persist_snapshots: self.cache.persist_snapshots,
            event_channel_size: d.event_channel_size,
        })
    }

    /// Parsed push URL, if push is configured.
    pub fn push_url(&self) -> Result<Option<url::Url>, ConfigError> {
        let Some(raw) = self.push.url.as_deref() else {
            return Ok(None);
        };
        let url: url::Url = raw
            .parse()
            .map_err(|_| invalid("push.url", format!("invalid URL: {raw}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Some(url)),
            other => Err(invalid(
                "push.url",
                format!("expected ws:// or wss://, got {other}://"),
            )),
        }
    }

    /// Configured cache root, or the platform cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache.dir.clone().unwrap_or_else(default_cache_dir)
    }
}

/// Bearer token for the push channel, read from `push.token_env`.
pub fn resolve_push_token(push: &PushSettings) -> Option<SecretString> {
    let name = push.token_env.as_deref()?;
    std::env::var(name).ok().map(SecretString::from)
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "latchsync", "latchsync")
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(".config").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn default_cache_dir() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(".cache"),
        |dirs| dirs.cache_dir().to_path_buf(),
    )
}

fn home_fallback(kind: &str) -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(kind);
    p.push("latchsync");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the config from the canonical path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load defaults, then `path` (if it exists), then `LATCHSYNC_*` variables.
///
/// Nested keys use a double underscore:
/// `LATCHSYNC_DISPATCH__MAX_ATTEMPTS=3`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(&config_path(), cfg)
}

pub fn save_config_to(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_translate_to_core_defaults() {
        let sync = Config::default().to_sync_config();
        let core = SyncConfig::default();
        let sync = match sync {
            Ok(sync) => sync,
            Err(e) => panic!("default config rejected: {e}"),
        };
        assert_eq!(sync.effect_timeout, core.effect_timeout);
        assert_eq!(sync.retry, core.retry);
        assert_eq!(sync.persist_snapshots, core.persist_snapshots);
        assert_eq!(sync.event_channel_size, core.event_channel_size);
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let mut cfg = Config::default();
        cfg.dispatch.initial_backoff_ms = 60_000;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Validation { field, .. }) if field == "dispatch.initial_backoff_ms"
        ));
    }

    #[test]
    fn push_url_must_be_websocket() {
        let mut cfg = Config::default();
        cfg.push.url = Some("https://push.example.com".into());
        assert!(cfg.push_url().is_err());

        cfg.push.url = Some("wss://push.example.com/v1/events".into());
        assert!(matches!(cfg.push_url(), Ok(Some(_))));
    }

    #[test]
    fn explicit_cache_dir_wins() {
        let mut cfg = Config::default();
        cfg.cache.dir = Some(PathBuf::from("/var/lib/latchsync"));
        assert_eq!(cfg.cache_dir(), PathBuf::from("/var/lib/latchsync"));
    }
}
