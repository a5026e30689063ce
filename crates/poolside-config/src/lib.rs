//! Shared configuration for poolside consumers.
//!
//! TOML profiles layered with environment overrides, translation to
//! `poolside_core::ControllerConfig` / `SupervisorConfig`, and logging
//! setup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use poolside_core::{
    AttributeMap, ConnectionConfig, ControllerConfig, CorrelationPolicy, DEFAULT_PORT,
    HeartbeatConfig, SupervisorConfig,
};

const ENV_PREFIX: &str = "POOLSIDE_";
const LOG_FILE_NAME: &str = "poolside.log";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("profile '{name}' not found")]
    ProfileNotFound { name: String },

    #[error("cannot determine a configuration directory")]
    NoConfigDir,

    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    /// Protocol and reconnection tuning shared by every profile.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named controller profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Look up `name`, or the default profile when `name` is `None`.
    pub fn profile<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get(name)
            .map(|profile| (name, profile))
            .ok_or_else(|| ConfigError::ProfileNotFound { name: name.into() })
    }
}

/// Durations are humantime strings ("30s", "5m").
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Defaults {
    pub connect_timeout: String,
    pub response_timeout: String,
    pub max_frame_size: usize,
    pub max_queue: usize,
    pub correlation: CorrelationPolicy,
    pub max_attributes_per_request: usize,
    pub heartbeat: HeartbeatDefaults,
    pub reconnect: ReconnectDefaults,
}

impl Default for Defaults {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        Self {
            connect_timeout: duration_string(connection.connect_timeout),
            response_timeout: duration_string(connection.response_timeout),
            max_frame_size: connection.max_frame_size,
            max_queue: connection.max_queue,
            correlation: connection.correlation,
            max_attributes_per_request: poolside_core::config::DEFAULT_MAX_ATTRIBUTES_PER_REQUEST,
            heartbeat: HeartbeatDefaults::default(),
            reconnect: ReconnectDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatDefaults {
    pub tick_interval: String,
    pub keepalive_interval: String,
    pub keepalive_timeout: String,
    pub max_missed_keepalives: u32,
    pub deadlock_window: String,
    pub idle_timeout: String,
}

impl Default for HeartbeatDefaults {
    fn default() -> Self {
        let heartbeat = HeartbeatConfig::default();
        Self {
            tick_interval: duration_string(heartbeat.tick_interval),
            keepalive_interval: duration_string(heartbeat.keepalive_interval),
            keepalive_timeout: duration_string(heartbeat.keepalive_timeout),
            max_missed_keepalives: heartbeat.max_missed_keepalives,
            deadlock_window: duration_string(heartbeat.deadlock_window),
            idle_timeout: duration_string(heartbeat.idle_timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectDefaults {
    pub base_delay: String,
    pub multiplier: f64,
    pub max_delay: String,
    pub failure_threshold: u32,
    pub cooldown: String,
    pub disconnect_debounce: String,
    pub stable_after: String,
}

impl Default for ReconnectDefaults {
    fn default() -> Self {
        let supervisor = SupervisorConfig::default();
        Self {
            base_delay: duration_string(supervisor.base_delay),
            multiplier: supervisor.multiplier,
            max_delay: duration_string(supervisor.max_delay),
            failure_threshold: supervisor.failure_threshold,
            cooldown: duration_string(supervisor.cooldown),
            disconnect_debounce: duration_string(supervisor.disconnect_debounce),
            stable_after: duration_string(supervisor.stable_after),
        }
    }
}

/// A named controller.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    /// Controller address (IP or hostname).
    pub host: String,

    /// TCP port. Defaults to 6681.
    pub port: Option<u16>,

    /// Override the default response timeout.
    pub response_timeout: Option<String>,

    /// Override the default connect timeout.
    pub connect_timeout: Option<String>,

    /// Override the default correlation policy.
    pub correlation: Option<CorrelationPolicy>,

    /// Tracked object types, each with an optional attribute list.
    pub attributes: Option<AttributeMap>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    /// Write to a daily-rotated file here instead of stderr.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    ProjectDirs::from("org", "poolside", "poolside")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path()?)
}

/// Load from `path` (missing file is fine) layered with `POOLSIDE_*`
/// environment variables. Nested keys use `__`, e.g.
/// `POOLSIDE_DEFAULTS__RESPONSE_TIMEOUT=45s`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    tracing::debug!(path = %path.display(), "loading configuration");
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    Ok(figment.extract()?)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path()?)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation to core config ──────────────────────────────────────

/// Build a `ControllerConfig` from a profile and the shared defaults.
pub fn profile_to_controller_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<ControllerConfig, ConfigError> {
    let hb = &defaults.heartbeat;
    let heartbeat = HeartbeatConfig {
        tick_interval: parse_nonzero_duration("heartbeat.tick_interval", &hb.tick_interval)?,
        keepalive_interval: parse_nonzero_duration(
            "heartbeat.keepalive_interval",
            &hb.keepalive_interval,
        )?,
        keepalive_timeout: parse_duration("heartbeat.keepalive_timeout", &hb.keepalive_timeout)?,
        max_missed_keepalives: hb.max_missed_keepalives,
        deadlock_window: parse_duration("heartbeat.deadlock_window", &hb.deadlock_window)?,
        idle_timeout: parse_duration("heartbeat.idle_timeout", &hb.idle_timeout)?,
    };

    let connection = ConnectionConfig {
        connect_timeout: parse_duration(
            "connect_timeout",
            profile
                .connect_timeout
                .as_deref()
                .unwrap_or(&defaults.connect_timeout),
        )?,
        response_timeout: parse_duration(
            "response_timeout",
            profile
                .response_timeout
                .as_deref()
                .unwrap_or(&defaults.response_timeout),
        )?,
        max_frame_size: defaults.max_frame_size,
        max_queue: defaults.max_queue,
        correlation: profile.correlation.unwrap_or(defaults.correlation),
        heartbeat,
    };

    let mut config = ControllerConfig::new(profile.host.clone())
        .with_port(profile.port.unwrap_or(DEFAULT_PORT))
        .with_connection(connection);
    if let Some(attributes) = &profile.attributes {
        config = config.with_attributes(attributes.clone());
    }
    config.max_attributes_per_request = defaults.max_attributes_per_request;
    Ok(config)
}

/// Build the reconnection policy from the shared defaults.
pub fn supervisor_config(defaults: &Defaults) -> Result<SupervisorConfig, ConfigError> {
    let rc = &defaults.reconnect;
    if !rc.multiplier.is_finite() || rc.multiplier < 1.0 {
        return Err(ConfigError::Validation {
            field: "reconnect.multiplier".into(),
            reason: format!("must be a finite number >= 1, got {}", rc.multiplier),
        });
    }
    Ok(SupervisorConfig {
        base_delay: parse_duration("reconnect.base_delay", &rc.base_delay)?,
        multiplier: rc.multiplier,
        max_delay: parse_duration("reconnect.max_delay", &rc.max_delay)?,
        failure_threshold: rc.failure_threshold,
        cooldown: parse_duration("reconnect.cooldown", &rc.cooldown)?,
        disconnect_debounce: parse_duration("reconnect.disconnect_debounce", &rc.disconnect_debounce)?,
        stable_after: parse_duration("reconnect.stable_after", &rc.stable_after)?,
    })
}

fn parse_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::Validation {
        field: field.into(),
        reason: format!("'{value}': {e}"),
    })
}

fn parse_nonzero_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    let duration = parse_duration(field, value)?;
    if duration.is_zero() {
        return Err(ConfigError::Validation {
            field: field.into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(duration)
}

fn duration_string(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

// ── Logging ─────────────────────────────────────────────────────────

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. When logging to a file the
/// returned guard must be held for the life of the process so buffered
/// lines are flushed.
pub fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let (writer, guard) = match &logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match logging.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(logging.directory.is_none())
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(writer))
            .try_init(),
    };
    result.map_err(|e| ConfigError::Logging(e.to_string()))?;

    Ok(guard)
}
