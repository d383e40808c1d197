//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use daq_runner::bus::Subscription;
use daq_runner::job::JobId;
use daq_runner::messages::{row, FieldValue, Payload};
use daq_runner::metadata::{MetadataField, MetadataSet, MetadataWriter};
use daq_runner::parameter::{Parameter, ParameterSet};
use daq_runner::procedure::{Column, ExecutionContext, Procedure, Status};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle call counts, shared with the test after the procedure is queued.
#[derive(Debug, Default)]
pub struct Counters {
    pub startups: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl Counters {
    pub fn startups(&self) -> usize {
        self.startups.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

/// Procedure whose behaviour is set up by the test.
///
/// Emits `Loop count` rows of `(Iteration, Value)`; optionally sleeps between
/// rows, fails on a given row, fails in startup or panics.
pub struct ScriptedProcedure {
    name: String,
    parameters: ParameterSet,
    fail_on_row: Option<i64>,
    fail_startup: bool,
    panic_in_execute: bool,
    honour_stop: bool,
    delay: Duration,
    counters: Arc<Counters>,
}

impl ScriptedProcedure {
    pub fn new(name: &str, loops: i64) -> Self {
        let mut parameters =
            ParameterSet::from_parameters([Parameter::integer("Loop count", 1).with_range(0.0, 1e6)])
                .expect("valid parameter set");
        parameters
            .set("Loop count", loops)
            .expect("loop count in range");
        Self {
            name: name.to_string(),
            parameters,
            fail_on_row: None,
            fail_startup: false,
            panic_in_execute: false,
            honour_stop: true,
            delay: Duration::ZERO,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Fail `execute()` instead of emitting the `n`-th row (1-based).
    pub fn failing_on_row(mut self, n: i64) -> Self {
        self.fail_on_row = Some(n);
        self
    }

    pub fn failing_startup(mut self) -> Self {
        self.fail_startup = true;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic_in_execute = true;
        self
    }

    /// Never look at the stop token.
    pub fn ignoring_stop(mut self) -> Self {
        self.honour_stop = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }
}

#[async_trait]
impl Procedure for ScriptedProcedure {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    fn metadata(&self) -> MetadataSet {
        MetadataSet::from_fields([MetadataField::new("Attempt").with_default(0)])
            .expect("valid metadata")
    }

    fn columns(&self) -> Vec<Column> {
        vec![Column::new("Iteration"), Column::with_unit("Value", "V")]
    }

    async fn startup(&mut self, metadata: &mut MetadataWriter<'_>) -> anyhow::Result<()> {
        self.counters.startups.fetch_add(1, Ordering::SeqCst);
        if self.fail_startup {
            anyhow::bail!("induced startup failure");
        }
        metadata.set("Attempt", 1)?;
        Ok(())
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        if self.panic_in_execute {
            panic!("induced panic");
        }
        let loops = self.parameters.integer("Loop count")?;
        for i in 0..loops {
            if self.honour_stop && ctx.should_stop() {
                return Ok(());
            }
            if self.fail_on_row == Some(i + 1) {
                anyhow::bail!("induced failure on row {}", i + 1);
            }
            ctx.emit_results(row([
                ("Iteration", FieldValue::from(i)),
                ("Value", FieldValue::from(0.5 * i as f64)),
            ]))?;
            ctx.emit_progress(100.0 * (i + 1) as f64 / loops as f64);

            if !self.delay.is_zero() {
                if self.honour_stop {
                    tokio::select! {
                        () = tokio::time::sleep(self.delay) => {}
                        () = ctx.stop_token().cancelled() => {}
                    }
                } else {
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory sink that starts failing once `limit` lines have been written.
#[derive(Clone, Debug)]
pub struct FailingWriter {
    limit: usize,
    lines: Arc<AtomicUsize>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl FailingWriter {
    pub fn after_lines(limit: usize) -> Self {
        Self {
            limit,
            lines: Arc::new(AtomicUsize::new(0)),
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    /// Lines after the column row.
    pub fn data_rows(&self) -> usize {
        let text = self.contents();
        match text.split_once("#Data:\n") {
            Some((_, data)) => data.lines().skip(1).count(),
            None => 0,
        }
    }
}

impl Write for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.lines.load(Ordering::SeqCst) >= self.limit {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        let newlines = buf.iter().filter(|b| **b == b'\n').count();
        self.lines.fetch_add(newlines, Ordering::SeqCst);
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Wait (bounded) until `job` publishes `status` on `subscription`.
pub async fn wait_for_status(subscription: &mut Subscription, job: JobId, status: Status) {
    let seen = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(message) = subscription.recv().await {
            if message.job == job && message.payload == Payload::Status(status) {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(seen, Ok(true), "job {job} never reached {status}");
}
