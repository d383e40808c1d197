//! Logging setup and the per-job logging context.
//!
//! Process-wide output goes through `tracing`; [`init`] installs a
//! `tracing_subscriber::fmt` subscriber filtered by `RUST_LOG` (or the configured
//! level when `RUST_LOG` is unset).
//!
//! Job-scoped logging does not rely on global state. A [`LogContext`] is built for
//! each job and handed explicitly to its worker and recorder: every record is both
//! emitted as a tracing event (tagged with the job id) and published on the bus as a
//! `"log"` message, so remote listeners see the same failures the console does.

use crate::bus::EventBus;
use crate::config::LoggingSettings;
use crate::error::{AppResult, DaqError};
use crate::job::JobId;
use crate::messages::{LogLevel, LogRecord, Message, Payload};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init(settings: &LoggingSettings) -> AppResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.level).map_err(|e| {
            DaqError::Configuration(format!("invalid log level '{}': {e}", settings.level))
        })?,
    };

    let installed = if settings.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

/// Logging handle bound to one job and one bus.
#[derive(Clone, Debug)]
pub struct LogContext {
    job: JobId,
    bus: EventBus,
}

impl LogContext {
    /// Context for `job` publishing on `bus`.
    pub fn new(job: JobId, bus: EventBus) -> Self {
        Self { job, bus }
    }

    /// Job this context logs for.
    pub fn job(&self) -> JobId {
        self.job
    }

    /// Debug-level record.
    pub fn debug(&self, message: impl Into<String>) {
        self.record(LogLevel::Debug, message.into());
    }

    /// Info-level record.
    pub fn info(&self, message: impl Into<String>) {
        self.record(LogLevel::Info, message.into());
    }

    /// Warning record.
    pub fn warn(&self, message: impl Into<String>) {
        self.record(LogLevel::Warn, message.into());
    }

    /// Error record.
    pub fn error(&self, message: impl Into<String>) {
        self.record(LogLevel::Error, message.into());
    }

    fn record(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => tracing::debug!(job = %self.job, "{message}"),
            LogLevel::Info => tracing::info!(job = %self.job, "{message}"),
            LogLevel::Warn => tracing::warn!(job = %self.job, "{message}"),
            LogLevel::Error => tracing::error!(job = %self.job, "{message}"),
        }
        self.bus.publish(Message::new(
            self.job,
            Payload::Log(LogRecord::now(level, message)),
        ));
    }
}
