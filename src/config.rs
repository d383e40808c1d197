//! Configuration System using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `DAQ_RUNNER_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! DAQ_RUNNER_LOGGING__LEVEL=debug
//! DAQ_RUNNER_BUS__MIRROR__ENABLED=true
//! DAQ_RUNNER_MANAGER__ABORT_TIMEOUT_MS=10000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_runner::config::Settings;
//!
//! let settings = Settings::load(Some("daq_runner.toml".as_ref()))?;
//! println!("Log level: {}", settings.logging.level);
//! # Ok::<(), daq_runner::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_RUNNER_";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging output
    pub logging: LoggingSettings,
    /// Event bus transports
    pub bus: BusSettings,
    /// Scheduler behaviour
    pub manager: ManagerSettings,
    /// Results file placement
    pub results: ResultsSettings,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing` env-filter directive (trace, debug, info, warn, error, or per-target)
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Ring buffer size for each remote subscriber; slower readers skip messages
    pub capacity: usize,
    /// Network mirror of every published message
    pub mirror: MirrorSettings,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
            mirror: MirrorSettings::default(),
        }
    }
}

/// TCP mirror configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorSettings {
    /// Whether to open the mirror at all
    pub enabled: bool,
    /// Interface to bind
    pub bind: String,
    /// Port to listen on; 0 picks a free port
    pub port: u16,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 5888,
        }
    }
}

impl MirrorSettings {
    /// `bind:port` address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Default time `abort()` waits for a terminal status; 0 waits forever
    pub abort_timeout_ms: u64,
    /// Hold the queue after an abort until `resume()` is called
    pub pause_on_abort: bool,
    /// Controller mailbox capacity
    pub command_capacity: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            abort_timeout_ms: 5_000,
            pause_on_abort: false,
            command_capacity: 64,
        }
    }
}

impl ManagerSettings {
    /// Abort timeout as a duration; `None` means wait forever.
    pub fn abort_timeout(&self) -> Option<Duration> {
        (self.abort_timeout_ms > 0).then(|| Duration::from_millis(self.abort_timeout_ms))
    }
}

/// Results file configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsSettings {
    /// Directory for generated file names
    pub directory: PathBuf,
    /// File name prefix for generated file names
    pub prefix: String,
}

impl Default for ResultsSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            prefix: "DATA".to_string(),
        }
    }
}

fn default_bus_capacity() -> usize {
    1024
}

impl Settings {
    /// Load defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(DaqError::Configuration(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate settings from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks that parsing cannot express.
    pub fn validate(&self) -> AppResult<()> {
        if self.bus.capacity == 0 {
            return Err(DaqError::Configuration(
                "bus.capacity must be at least 1".to_string(),
            ));
        }
        if self.manager.command_capacity == 0 {
            return Err(DaqError::Configuration(
                "manager.command_capacity must be at least 1".to_string(),
            ));
        }
        if self.results.prefix.trim().is_empty() {
            return Err(DaqError::Configuration(
                "results.prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.manager.abort_timeout(), Some(Duration::from_secs(5)));
        assert!(!settings.bus.mirror.enabled);
    }

    #[test]
    fn toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[logging]
level = "debug"

[bus.mirror]
enabled = true
port = 0

[manager]
abort_timeout_ms = 0
"#
        )
        .unwrap();

        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(file.path()));
        let settings = Settings::from_figment(figment).unwrap();
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.bus.mirror.enabled);
        assert_eq!(settings.bus.mirror.address(), "127.0.0.1:0");
        assert_eq!(settings.manager.abort_timeout(), None);
        assert_eq!(settings.bus.capacity, 1024);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string("[bus]\ncapacity = 0"));
        assert!(matches!(
            Settings::from_figment(figment),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Settings::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(result.is_err());
    }
}
