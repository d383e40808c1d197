//! Drives one procedure through its lifecycle.
//!
//! A [`Worker`] runs on its own tokio task, separate from the manager's controller
//! and from every listener. It owns the procedure for the duration of the run and
//! reports exclusively through the event bus and the job's status channel.
//!
//! ## Status rules
//!
//! | outcome                                               | status     |
//! |-------------------------------------------------------|------------|
//! | `startup()`/`execute()`/`shutdown()` error or panic   | `FAILED`   |
//! | results file write failed                             | `FAILED`   |
//! | stop request observed by the procedure                | `ABORTED`  |
//! | anything else                                         | `FINISHED` |
//!
//! `shutdown()` runs exactly once on every path that reaches it, including after a
//! failed `startup()`.

use crate::bus::EventBus;
use crate::error::DaqError;
use crate::job::JobId;
use crate::logging::LogContext;
use crate::messages::{Message, Payload};
use crate::metadata::MetadataWriter;
use crate::procedure::{ExecutionContext, Procedure, Status, StopToken};
use crate::recorder::Recorder;
use crate::results::Results;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// State shared between a running job, its recorder and the manager.
#[derive(Debug, Default)]
pub struct JobControl {
    stop: StopToken,
    emitted: AtomicU64,
    fault: Mutex<Option<String>>,
}

impl JobControl {
    /// Fresh control block.
    pub fn new() -> Self {
        Self::default()
    }

    /// The job's cooperative stop token.
    pub fn stop_token(&self) -> &StopToken {
        &self.stop
    }

    /// Ask the procedure to stop. Advisory only.
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    pub(crate) fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::SeqCst);
    }

    /// Rows published by the procedure so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::SeqCst)
    }

    /// Mark the job failed for a reason outside the procedure. The first reason wins.
    pub fn fault(&self, reason: impl Into<String>) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(reason.into());
        }
    }

    /// Whether [`fault`](Self::fault) has been called.
    pub fn is_faulted(&self) -> bool {
        self.fault.lock().is_some()
    }

    /// The recorded fault, if any.
    pub fn fault_reason(&self) -> Option<String> {
        self.fault.lock().clone()
    }
}

/// Lifecycle driver for one procedure.
pub struct Worker {
    job: JobId,
    procedure: Box<dyn Procedure>,
    control: Arc<JobControl>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("job", &self.job)
            .field("procedure", &self.procedure.name())
            .finish()
    }
}

impl Worker {
    /// Worker for `procedure` running as `job`.
    pub fn new(job: JobId, procedure: Box<dyn Procedure>) -> Self {
        Self {
            job,
            procedure,
            control: Arc::new(JobControl::new()),
        }
    }

    /// The procedure this worker will run.
    pub fn procedure(&self) -> &dyn Procedure {
        self.procedure.as_ref()
    }

    /// Handle for stop requests and fault inspection.
    pub fn control(&self) -> Arc<JobControl> {
        Arc::clone(&self.control)
    }

    /// Run the full lifecycle and return the terminal status.
    ///
    /// The terminal status is published on the bus and on `status` only after the
    /// recorder has handled every row and closed the file.
    pub async fn run(
        self,
        results: Arc<Mutex<Results>>,
        bus: EventBus,
        status: Arc<watch::Sender<Status>>,
    ) -> Status {
        let Worker {
            job,
            mut procedure,
            control,
        } = self;
        let log = LogContext::new(job, bus.clone());
        let mut recorder = Recorder::spawn(
            job,
            Arc::clone(&results),
            &bus,
            Arc::clone(&control),
            log.clone(),
        );

        status.send_replace(Status::Running);
        bus.publish(Message::new(job, Payload::Status(Status::Running)));
        info!(job = %job, procedure = procedure.name(), "job started");

        let mut failure: Option<DaqError> = None;
        let mut metadata = procedure.metadata();
        let mut writer = MetadataWriter::new(&mut metadata);
        let started = guarded("startup", procedure.startup(&mut writer)).await;

        match started {
            Ok(()) => {
                let stored = results.lock().store_metadata(&metadata);
                match stored {
                    Ok(()) => {
                        let columns = procedure.columns().into();
                        let ctx = ExecutionContext::new(
                            job,
                            columns,
                            bus.clone(),
                            Arc::clone(&control),
                            log.clone(),
                        );
                        if let Err(e) = guarded("execute", procedure.execute(&ctx)).await {
                            failure = Some(e);
                        }
                    }
                    Err(e) => {
                        control.fault(e.to_string());
                        failure = Some(e);
                    }
                }
            }
            Err(e) => failure = Some(e),
        }

        if let Some(e) = &failure {
            log.error(e.to_string());
        }
        if let Err(e) = guarded("shutdown", procedure.shutdown()).await {
            log.error(e.to_string());
            failure.get_or_insert(e);
        }

        recorder.drained(control.emitted()).await;

        let terminal = if failure.is_some() || control.is_faulted() {
            Status::Failed
        } else if control.stop_token().was_observed() {
            Status::Aborted
        } else {
            Status::Finished
        };

        bus.publish(Message::new(job, Payload::Status(terminal)));
        recorder.join().await;
        status.send_replace(terminal);
        info!(job = %job, status = %terminal, "job ended");
        terminal
    }
}

/// Await a lifecycle call, turning errors and panics into [`DaqError::Lifecycle`].
async fn guarded<F>(phase: &str, call: F) -> Result<(), DaqError>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DaqError::Lifecycle(format!("{phase}() failed: {e:#}"))),
        Err(panic) => Err(DaqError::Lifecycle(format!(
            "{phase}() panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Filter;
    use crate::messages::row;
    use crate::metadata::{MetadataField, MetadataSet};
    use crate::parameter::ParameterSet;
    use crate::procedure::Column;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Probe {
        parameters: ParameterSet,
        rows: usize,
        fail_startup: bool,
        panic_in_execute: bool,
        stop_aware: bool,
        progress: Vec<f64>,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Procedure for Probe {
        fn name(&self) -> &str {
            "Probe"
        }
        fn parameters(&self) -> &ParameterSet {
            &self.parameters
        }
        fn metadata(&self) -> MetadataSet {
            MetadataSet::from_fields([MetadataField::new("Serial")]).unwrap()
        }
        fn columns(&self) -> Vec<Column> {
            vec![Column::new("N")]
        }
        async fn startup(&mut self, metadata: &mut MetadataWriter<'_>) -> anyhow::Result<()> {
            if self.fail_startup {
                anyhow::bail!("instrument not found");
            }
            metadata.set("Serial", "SN-42")?;
            Ok(())
        }
        async fn execute(&mut self, ctx: &ExecutionContext) -> anyhow::Result<()> {
            if self.panic_in_execute {
                panic!("boom");
            }
            for n in 0..self.rows {
                if self.stop_aware && ctx.should_stop() {
                    return Ok(());
                }
                ctx.emit_results(row([("N", n)]))?;
            }
            for percent in &self.progress {
                ctx.emit_progress(*percent);
            }
            Ok(())
        }
        async fn shutdown(&mut self) -> anyhow::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn run(probe: Probe, stop_first: bool) -> (Status, Vec<Payload>, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.csv");
        let results = Arc::new(Mutex::new(Results::create(&path, &probe).unwrap()));
        let bus = EventBus::local();
        let job = JobId::new();
        let mut sub = bus.subscribe(Filter::all().job(job));
        let worker = Worker::new(job, Box::new(probe));
        if stop_first {
            worker.control().request_stop();
        }
        let (tx, _rx) = watch::channel(Status::Queued);
        let status = worker.run(results, bus, Arc::new(tx)).await;

        let mut payloads = Vec::new();
        while let Some(msg) = sub.try_recv() {
            payloads.push(msg.payload);
        }
        (status, payloads, std::fs::read_to_string(&path).unwrap())
    }

    #[tokio::test]
    async fn finishes_and_records_every_row() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let probe = Probe {
            rows: 4,
            shutdowns: shutdowns.clone(),
            ..Default::default()
        };
        let (status, payloads, file) = run(probe, false).await;
        assert_eq!(status, Status::Finished);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(payloads.first(), Some(&Payload::Status(Status::Running)));
        assert_eq!(payloads.last(), Some(&Payload::Status(Status::Finished)));
        assert!(file.contains("#Serial: SN-42"));
        assert!(file.ends_with("N\n0\n1\n2\n3\n"));
    }

    #[tokio::test]
    async fn failed_startup_still_shuts_down() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let probe = Probe {
            rows: 4,
            fail_startup: true,
            shutdowns: shutdowns.clone(),
            ..Default::default()
        };
        let (status, payloads, file) = run(probe, false).await;
        assert_eq!(status, Status::Failed);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(payloads.iter().any(|p| matches!(
            p,
            Payload::Log(record) if record.message.contains("instrument not found")
        )));
        assert!(file.contains("#Data:"));
        assert!(!file.contains("#Metadata:"));
    }

    #[tokio::test]
    async fn panic_is_reported_as_failure() {
        let probe = Probe {
            panic_in_execute: true,
            ..Default::default()
        };
        let (status, payloads, _) = run(probe, false).await;
        assert_eq!(status, Status::Failed);
        assert!(payloads.iter().any(|p| matches!(
            p,
            Payload::Log(record) if record.message.contains("panicked: boom")
        )));
    }

    #[tokio::test]
    async fn observed_stop_aborts() {
        let probe = Probe {
            rows: 10,
            stop_aware: true,
            ..Default::default()
        };
        let (status, _, file) = run(probe, true).await;
        assert_eq!(status, Status::Aborted);
        assert!(file.ends_with("N\n"));
    }

    #[tokio::test]
    async fn ignored_stop_finishes() {
        let probe = Probe {
            rows: 3,
            ..Default::default()
        };
        let (status, _, _) = run(probe, true).await;
        assert_eq!(status, Status::Finished);
    }

    #[tokio::test]
    async fn progress_is_clamped_and_ordered() {
        let probe = Probe {
            rows: 1,
            progress: vec![-5.0, 25.0, 60.5, 150.0, f64::NAN],
            ..Default::default()
        };
        let (status, payloads, _) = run(probe, false).await;
        assert_eq!(status, Status::Finished);
        let progress: Vec<f64> = payloads
            .iter()
            .filter_map(|p| match p {
                Payload::Progress(percent) => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![0.0, 25.0, 60.5, 100.0, 0.0]);

        // Progress is published after the row it follows and before the terminal status.
        let first_progress = payloads
            .iter()
            .position(|p| matches!(p, Payload::Progress(_)))
            .unwrap();
        let row = payloads
            .iter()
            .position(|p| matches!(p, Payload::Results(_)))
            .unwrap();
        assert!(row < first_progress);
        assert_eq!(payloads.last(), Some(&Payload::Status(Status::Finished)));
    }

    #[tokio::test]
    async fn lifecycle_failures_are_typed() {
        let err = guarded("execute", async { Err(anyhow::anyhow!("no instrument")) })
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            DaqError::Lifecycle(message) if message == "execute() failed: no instrument"
        ));

        let err = guarded("startup", async {
            if true {
                panic!("boom");
            }
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(
            &err,
            DaqError::Lifecycle(message) if message == "startup() panicked: boom"
        ));
        assert!(err.to_string().starts_with("Procedure lifecycle error:"));
    }

    #[test]
    fn first_fault_wins() {
        let control = JobControl::new();
        assert!(!control.is_faulted());
        control.fault("disk full");
        control.fault("later");
        assert_eq!(control.fault_reason().as_deref(), Some("disk full"));
    }
}
