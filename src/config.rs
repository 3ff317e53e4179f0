//! Layered configuration for the agent.
//!
//! Settings are read from an optional TOML file and fall back to built-in
//! defaults, so the binary runs with no configuration at all. Durations are
//! written in human form (`"100ms"`, `"1s"`) via `humantime_serde`.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, File};
use serde::Deserialize;

use crate::error::{AppResult, SmuError};

/// Top-level application settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub connection: ConnectionSettings,
    pub poll: PollSettings,
    pub reconnect: ReconnectSettings,
    pub storage: StorageSettings,
}

/// Serial transport and handshake parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSettings {
    pub baud_rate: u32,
    /// Per-response read deadline.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Substring the `*IDN?` reply must contain (case-insensitive).
    pub idn_marker: String,
    /// Attempts made by the initial open before giving up.
    pub open_retries: u32,
}

/// Status polling cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollSettings {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

/// Reconnect backoff schedule.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

/// CSV recorder defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub log_voltage: bool,
    pub log_current: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            connection: ConnectionSettings::default(),
            poll: PollSettings::default(),
            reconnect: ReconnectSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(200),
            idn_marker: "SMU".into(),
            open_retries: 3,
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(3),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            interval: Duration::from_secs(1),
            log_voltage: true,
            log_current: true,
        }
    }
}

impl Settings {
    /// Load settings from the given TOML file, or defaults when `path` is
    /// `None` or the file does not exist. Validates before returning.
    pub fn new(path: Option<&str>) -> AppResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would stall or spin the background loops.
    pub fn validate(&self) -> AppResult<()> {
        if self.poll.interval.is_zero() {
            return Err(SmuError::Configuration(
                "poll.interval must be greater than zero".into(),
            ));
        }
        if self.storage.interval.is_zero() {
            return Err(SmuError::Configuration(
                "storage.interval must be greater than zero".into(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(SmuError::Configuration(
                "reconnect.max_attempts must be at least 1".into(),
            ));
        }
        if self.reconnect.backoff_factor < 1.0 {
            return Err(SmuError::Configuration(
                "reconnect.backoff_factor must be >= 1.0".into(),
            ));
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(SmuError::Configuration(
                "reconnect.max_delay must be >= reconnect.initial_delay".into(),
            ));
        }
        if self.connection.idn_marker.trim().is_empty() {
            return Err(SmuError::Configuration(
                "connection.idn_marker must not be empty".into(),
            ));
        }
        Ok(())
    }
}
