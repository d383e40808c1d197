//! Message types for bus traffic and manager commands
//!
//! Two families live here:
//!
//! - [`Message`]: a `(topic, payload)` pair published by a worker on the event bus.
//!   The four topics are fixed: `status`, `progress`, `results` and `log`.
//! - [`ManagerCommand`]: requests sent to the manager's controller task. Each command
//!   carries a `oneshot` responder; the helper constructors return the command together
//!   with the matching receiver.

use crate::error::AppResult;
use crate::job::{Job, JobHandle, JobId, JobInfo};
use crate::procedure::Status;
use crate::units::Quantity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::{oneshot, watch};

// =============================================================================
// Bus messages
// =============================================================================

/// Topic of a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    /// Status transitions.
    Status,
    /// Completion percentage.
    Progress,
    /// Result rows.
    Results,
    /// Log records.
    Log,
}

impl Topic {
    /// Wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Status => "status",
            Topic::Progress => "progress",
            Topic::Results => "results",
            Topic::Log => "log",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field of a `"results"` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Plain number, taken to be in the column's unit.
    Number(f64),
    /// Number with an explicit unit.
    Quantity(Quantity),
    /// Free text.
    Text(String),
    /// No value (serialized as `null`).
    Empty,
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Number(value.into())
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Number(value.into())
    }
}

impl From<usize> for FieldValue {
    fn from(value: usize) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<Quantity> for FieldValue {
    fn from(value: Quantity) -> Self {
        FieldValue::Quantity(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// A `"results"` row keyed by column name.
pub type Row = BTreeMap<String, FieldValue>;

/// Build a [`Row`] from `(column, value)` pairs.
pub fn row<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Row
where
    K: Into<String>,
    V: Into<FieldValue>,
{
    fields
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Severity of a `"log"` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress.
    Info,
    /// Something was stored as NaN or otherwise degraded.
    Warn,
    /// The job failed or cannot record.
    Error,
}

/// Payload of a `"log"` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Human-readable text.
    pub message: String,
    /// When the record was created.
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Record stamped with the current time.
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Topic-tagged payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "data", rename_all = "lowercase")]
pub enum Payload {
    /// Status transition.
    Status(Status),
    /// Completion percentage, 0 to 100.
    Progress(f64),
    /// One row matching the column schema.
    Results(Row),
    /// A log record.
    Log(LogRecord),
}

/// A bus message from the worker running `job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Job whose worker published the message.
    pub job: JobId,
    /// Topic-tagged content.
    pub payload: Payload,
}

impl Message {
    /// Wrap a payload for `job`.
    pub fn new(job: JobId, payload: Payload) -> Self {
        Self { job, payload }
    }

    /// Topic derived from the payload.
    pub fn topic(&self) -> Topic {
        match self.payload {
            Payload::Status(_) => Topic::Status,
            Payload::Progress(_) => Topic::Progress,
            Payload::Results(_) => Topic::Results,
            Payload::Log(_) => Topic::Log,
        }
    }
}

// =============================================================================
// Manager commands
// =============================================================================

/// Commands processed by the manager's controller task
#[derive(Debug)]
pub enum ManagerCommand {
    /// Append a job to the queue
    Queue {
        /// Job to append.
        job: Box<Job>,
        /// Receives the job's handle.
        response: oneshot::Sender<JobHandle>,
    },

    /// Request the running job to stop; replies with its status channel
    Abort {
        /// Receives the running job's status channel.
        response: oneshot::Sender<AppResult<watch::Receiver<Status>>>,
    },

    /// Start the next queued job if idle
    Resume {
        /// Receives whether a job was started.
        response: oneshot::Sender<bool>,
    },

    /// Remove a job that is still queued
    Remove {
        /// Job to remove.
        id: JobId,
        /// Receives the outcome.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Remove every queued job
    ClearQueued {
        /// Receives the number of jobs removed.
        response: oneshot::Sender<usize>,
    },

    /// Snapshot of running and queued jobs
    List {
        /// Receives the snapshot.
        response: oneshot::Sender<Vec<JobInfo>>,
    },

    /// Internal: a worker reached a terminal status
    JobFinished {
        /// Job that finished.
        id: JobId,
        /// Its terminal status.
        status: Status,
    },

    /// Stop the controller
    Shutdown {
        /// Signalled once the controller has stopped.
        response: oneshot::Sender<()>,
    },
}

impl ManagerCommand {
    /// Helper to create a Queue command
    pub fn queue(job: Job) -> (Self, oneshot::Receiver<JobHandle>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Queue {
                job: Box::new(job),
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create an Abort command
    pub fn abort() -> (Self, oneshot::Receiver<AppResult<watch::Receiver<Status>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Abort { response: tx }, rx)
    }

    /// Helper to create a Resume command
    pub fn resume() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::Resume { response: tx }, rx)
    }

    /// Helper to create a Remove command
    pub fn remove(id: JobId) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Remove { id, response: tx }, rx)
    }

    /// Helper to create a ClearQueued command
    pub fn clear_queued() -> (Self, oneshot::Receiver<usize>) {
        let (tx, rx) = oneshot::channel();
        (Self::ClearQueued { response: tx }, rx)
    }

    /// Helper to create a List command
    pub fn list() -> (Self, oneshot::Receiver<Vec<JobInfo>>) {
        let (tx, rx) = oneshot::channel();
        (Self::List { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_follows_payload() {
        let id = JobId::new();
        assert_eq!(
            Message::new(id, Payload::Progress(50.0)).topic(),
            Topic::Progress
        );
        assert_eq!(
            Message::new(id, Payload::Status(Status::Running)).topic(),
            Topic::Status
        );
    }

    #[test]
    fn message_json_shape() {
        let id = JobId::new();
        let msg = Message::new(
            id,
            Payload::Results(row([
                ("Iteration", FieldValue::from(1)),
                ("Voltage", Quantity::new(2.5, "mV").into()),
            ])),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"]["topic"], "results");
        assert_eq!(json["payload"]["data"]["Iteration"], 1.0);
        assert_eq!(json["payload"]["data"]["Voltage"]["unit"], "mV");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn null_field_reads_back_as_empty() {
        let parsed: FieldValue = serde_json::from_str("null").unwrap();
        assert_eq!(parsed, FieldValue::Empty);
    }
}
