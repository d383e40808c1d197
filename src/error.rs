//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur while binding, running and persisting
//! procedures.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the failure classes of the execution engine:
//!
//! - **Validation** (`Validation`, `UnknownParameter`): an invalid
//!   parameter binding. Raised synchronously to the caller, before a job exists.
//! - **Lifecycle** (`Lifecycle`): an error or panic raised inside a procedure's
//!   `startup()`/`execute()`/`shutdown()`. The worker converts it into a `FAILED`
//!   status plus a `"log"` message; it never escapes the worker task.
//! - **Persistence** (`Persistence`, `Io`, `Csv`, `RowSchema`, `HeaderParse`): results
//!   file failures. Fatal to the job that owns the file.
//! - **Scheduler** (`JobNotFound`, `JobNotQueued`, `NothingRunning`, `ManagerStopped`):
//!   misuse of the manager API. A failing job never produces one of these.
//! - **Configuration** (`Config`, `Configuration`): figment extraction failures and
//!   semantic validation of the loaded settings.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use crate::job::JobId;
use crate::procedure::Status;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every error the crate reports.
#[derive(Error, Debug)]
pub enum DaqError {
    /// A parameter value was refused by its kind or validator.
    #[error("Invalid value for parameter '{parameter}': {reason}")]
    Validation {
        /// Parameter (or metadata field) name.
        parameter: String,
        /// Why the value was refused.
        reason: String,
    },

    /// No parameter or metadata field of that name is declared.
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    /// A row has unknown or missing columns.
    #[error("Row does not match the column schema: {0}")]
    RowSchema(String),

    /// `startup()`, `execute()` or `shutdown()` returned an error or panicked.
    #[error("Procedure lifecycle error: {0}")]
    Lifecycle(String),

    /// The results file could not be written or would not read back.
    #[error("Results persistence error: {0}")]
    Persistence(String),

    /// Filesystem or socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding or decoding failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A results file header could not be parsed.
    #[error("Malformed results header at line {line}: {reason}")]
    HeaderParse {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// figment could not extract the settings.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings parsed but failed [`Settings::validate`](crate::config::Settings::validate).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A mirror line could not be encoded or decoded.
    #[error("Event bus error: {0}")]
    Bus(String),

    /// The manager has never seen this job.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// The job exists but is no longer queued.
    #[error("Job {id} is {status}; only QUEUED jobs can be removed")]
    JobNotQueued {
        /// The job.
        id: JobId,
        /// Its status when the request arrived.
        status: Status,
    },

    /// `abort()` was called with no job running.
    #[error("No job is running")]
    NothingRunning,

    /// The manager's controller task has exited.
    #[error("Manager is no longer running")]
    ManagerStopped,
}

impl DaqError {
    /// Shorthand for a validation failure on a named parameter.
    pub fn validation(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
