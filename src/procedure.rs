//! The procedure contract.
//!
//! A [`Procedure`] is a user-defined unit of work: bound parameters, declared
//! metadata, a column schema for its output rows, and a three-phase lifecycle
//! (`startup`, `execute`, `shutdown`).
//!
//! # Lifecycle
//!
//! ```text
//!  QUEUED ──► RUNNING ──► startup() ──► execute(ctx) ──► shutdown() ──► FINISHED
//!                            │              │                │          ABORTED
//!                            └── error ─────┴── error ───────┘          FAILED
//! ```
//!
//! `shutdown()` is called exactly once whatever happens in the first two phases.
//!
//! # Cancellation
//!
//! Stopping is cooperative. The worker hands `execute()` an [`ExecutionContext`]
//! whose [`StopToken`] turns into "should stop" when the manager aborts the job.
//! The procedure decides where to look at it: typically once per loop iteration
//! and around every wait. A procedure that never looks cannot be stopped, and
//! a job is only reported `ABORTED` if the procedure actually observed the request.

use crate::bus::EventBus;
use crate::error::{AppResult, DaqError};
use crate::job::JobId;
use crate::logging::LogContext;
use crate::messages::{Message, Payload, Row};
use crate::metadata::{MetadataSet, MetadataWriter};
use crate::parameter::ParameterSet;
use crate::units::Unit;
use crate::worker::JobControl;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Job status; the last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Waiting in the manager's queue.
    Queued,
    /// Its worker is driving the lifecycle.
    Running,
    /// A lifecycle call or the results file failed.
    Failed,
    /// The procedure observed a stop request.
    Aborted,
    /// Completed normally.
    Finished,
}

impl Status {
    /// Whether the job will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Failed | Status::Aborted | Status::Finished)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Failed => "FAILED",
            Status::Aborted => "ABORTED",
            Status::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Column schema
// =============================================================================

/// How values in a column are checked on append.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnCheck {
    /// Stored as given.
    Unchecked,
    /// Converted into this unit; incompatible or non-numeric values become NaN.
    Checked(Unit),
}

/// One output column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    check: ColumnCheck,
}

impl Column {
    /// Column without a unit.
    ///
    /// The name must read back unchanged from the column row, so a name like
    /// `"Gain (dB)"` is refused when the results file is created; use
    /// [`Column::with_unit`] instead.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            check: ColumnCheck::Unchecked,
        }
    }

    /// Column whose values are expressed in `unit`.
    pub fn with_unit(name: impl Into<String>, unit: &str) -> Self {
        Self {
            name: name.into(),
            check: ColumnCheck::Checked(Unit::parse(unit)),
        }
    }

    /// Parse a header label such as `"Voltage (V)"`.
    pub fn parse(label: &str) -> Self {
        let label = label.trim();
        if let Some(open) = label.rfind(" (") {
            if let Some(unit) = label[open + 2..].strip_suffix(')') {
                if !unit.trim().is_empty() {
                    return Self::with_unit(&label[..open], unit.trim());
                }
            }
        }
        Self::new(label)
    }

    /// Column name; rows are keyed by it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check applied on append.
    pub fn check(&self) -> &ColumnCheck {
        &self.check
    }

    /// Unit, for checked columns.
    pub fn unit(&self) -> Option<&Unit> {
        match &self.check {
            ColumnCheck::Checked(unit) => Some(unit),
            ColumnCheck::Unchecked => None,
        }
    }

    /// Header label, e.g. `"Voltage (V)"`.
    pub fn label(&self) -> String {
        match &self.check {
            ColumnCheck::Checked(unit) => format!("{} ({})", self.name, unit),
            ColumnCheck::Unchecked => self.name.clone(),
        }
    }
}

/// Check that `row` has exactly the columns of `columns`.
pub fn validate_row(columns: &[Column], row: &Row) -> AppResult<()> {
    if let Some(unknown) = row.keys().find(|k| !columns.iter().any(|c| c.name == **k)) {
        return Err(DaqError::RowSchema(format!("unknown column '{unknown}'")));
    }
    let missing: Vec<&str> = columns
        .iter()
        .map(Column::name)
        .filter(|name| !row.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        return Err(DaqError::RowSchema(format!(
            "missing column(s): {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative stop request shared between the manager and one procedure.
///
/// Requesting a stop never interrupts anything by itself. The procedure polls
/// [`should_stop`](StopToken::should_stop) or awaits [`cancelled`](StopToken::cancelled)
/// at points of its choosing; doing so marks the request as observed.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    token: CancellationToken,
    observed: Arc<AtomicBool>,
}

impl StopToken {
    /// Fresh token with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the procedure to stop. Idempotent.
    pub fn request_stop(&self) {
        self.token.cancel();
    }

    /// Whether a stop has been requested, without marking it observed.
    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Poll point for procedures; `true` means "return early now".
    pub fn should_stop(&self) -> bool {
        let requested = self.token.is_cancelled();
        if requested {
            self.observed.store(true, Ordering::SeqCst);
        }
        requested
    }

    /// Resolves once a stop is requested (and marks it observed).
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
        self.observed.store(true, Ordering::SeqCst);
    }

    /// Whether the procedure saw the request.
    pub fn was_observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Execution context
// =============================================================================

/// What `execute()` gets to talk to the outside world.
pub struct ExecutionContext {
    job: JobId,
    columns: Arc<[Column]>,
    bus: EventBus,
    control: Arc<JobControl>,
    log: LogContext,
}

impl ExecutionContext {
    pub(crate) fn new(
        job: JobId,
        columns: Arc<[Column]>,
        bus: EventBus,
        control: Arc<JobControl>,
        log: LogContext,
    ) -> Self {
        Self {
            job,
            columns,
            bus,
            control,
            log,
        }
    }

    /// Identity of the running job.
    pub fn job(&self) -> JobId {
        self.job
    }

    /// Publish one row on the `"results"` topic.
    ///
    /// The row must carry exactly the declared columns; otherwise nothing is
    /// published and [`DaqError::RowSchema`] is returned.
    pub fn emit_results(&self, row: Row) -> AppResult<()> {
        validate_row(&self.columns, &row)?;
        self.bus
            .publish(Message::new(self.job, Payload::Results(row)));
        self.control.record_emitted();
        Ok(())
    }

    /// Publish completion in percent; clamped to 0..=100.
    pub fn emit_progress(&self, percent: f64) {
        let percent = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };
        self.bus
            .publish(Message::new(self.job, Payload::Progress(percent)));
    }

    /// Poll point: `true` once the job has been asked to stop.
    pub fn should_stop(&self) -> bool {
        self.control.stop_token().should_stop()
    }

    /// The stop token, for `select!`-style waits.
    pub fn stop_token(&self) -> &StopToken {
        self.control.stop_token()
    }

    /// Log to tracing and to the `"log"` topic.
    pub fn log(&self) -> &LogContext {
        &self.log
    }
}

// =============================================================================
// Procedure trait
// =============================================================================

/// A user-defined measurement job.
///
/// The worker calls the lifecycle methods on its own task, in order, exactly once
/// each (`execute()` is skipped when `startup()` fails). Errors are reported through
/// `anyhow` and turned into a `FAILED` status.
#[async_trait]
pub trait Procedure: Send + 'static {
    /// Display name, written to the results header.
    fn name(&self) -> &str;

    /// Bound parameter values.
    fn parameters(&self) -> &ParameterSet;

    /// Declared metadata with defaults; filled in by `startup()`.
    fn metadata(&self) -> MetadataSet {
        MetadataSet::new()
    }

    /// Output columns, in file order.
    fn columns(&self) -> Vec<Column>;

    /// Prepare instruments; may record metadata.
    async fn startup(&mut self, _metadata: &mut MetadataWriter<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Main loop; should poll `ctx.should_stop()` at its yield points.
    async fn execute(&mut self, ctx: &ExecutionContext) -> anyhow::Result<()>;

    /// Release instruments. Runs after `execute()` returns or fails.
    async fn shutdown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{row, FieldValue};

    #[test]
    fn column_labels_round_trip() {
        let col = Column::parse("Voltage (mV)");
        assert_eq!(col.name(), "Voltage");
        assert_eq!(col.unit().map(Unit::symbol), Some("mV"));
        assert_eq!(col.label(), "Voltage (mV)");

        let plain = Column::parse("Iteration");
        assert_eq!(plain.check(), &ColumnCheck::Unchecked);
        assert_eq!(plain.label(), "Iteration");
    }

    #[test]
    fn parenthesis_without_unit_stays_in_name() {
        let col = Column::parse("Gain ()");
        assert_eq!(col.name(), "Gain ()");
        assert_eq!(col.check(), &ColumnCheck::Unchecked);
    }

    #[test]
    fn row_validation() {
        let columns = vec![Column::new("Iteration"), Column::with_unit("Voltage", "V")];
        let ok = row([("Iteration", FieldValue::from(1)), ("Voltage", 0.5.into())]);
        assert!(validate_row(&columns, &ok).is_ok());

        let extra = row([
            ("Iteration", FieldValue::from(1)),
            ("Voltage", 0.5.into()),
            ("Current", 0.1.into()),
        ]);
        assert!(matches!(
            validate_row(&columns, &extra),
            Err(DaqError::RowSchema(_))
        ));

        let missing = row([("Iteration", FieldValue::from(1))]);
        let err = validate_row(&columns, &missing).unwrap_err();
        assert!(err.to_string().contains("Voltage"));
    }

    #[test]
    fn stop_token_tracks_observation() {
        let token = StopToken::new();
        assert!(!token.should_stop());
        token.request_stop();
        assert!(token.is_requested());
        assert!(!token.was_observed());
        assert!(token.should_stop());
        assert!(token.was_observed());
    }

    #[tokio::test]
    async fn cancelled_marks_observed() {
        let token = StopToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        token.request_stop();
        task.await.unwrap();
        assert!(token.was_observed());
    }

    #[test]
    fn terminal_states() {
        assert!(!Status::Queued.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(Status::Aborted.is_terminal());
        assert!(Status::Finished.is_terminal());
    }
}
