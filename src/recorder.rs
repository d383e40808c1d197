//! Persists a job's `"results"` messages.
//!
//! The recorder is a task subscribed to the `"results"` and `"status"` topics of a
//! single job. Rows are appended to the job's [`Results`] in arrival order; the task
//! ends when the job's terminal status arrives.
//!
//! After each row it bumps a `watch` counter. The worker waits on that counter
//! ([`RecorderHandle::drained`]) before publishing the terminal status, so a
//! terminal status always means every emitted row has been handled.
//!
//! A failed append is fatal to the job: the job is marked faulted, an error is
//! logged on the `"log"` topic and the procedure is asked to stop. Later rows are
//! counted but no longer written.

use crate::bus::{EventBus, Filter};
use crate::job::JobId;
use crate::logging::LogContext;
use crate::messages::{Payload, Topic};
use crate::results::Results;
use crate::worker::JobControl;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Spawns recorder tasks.
pub struct Recorder;

impl Recorder {
    /// Subscribe to `job`'s messages and start appending to `results`.
    ///
    /// The subscription exists when this returns, so nothing the job publishes
    /// afterwards can be missed.
    pub fn spawn(
        job: JobId,
        results: Arc<Mutex<Results>>,
        bus: &EventBus,
        control: Arc<JobControl>,
        log: LogContext,
    ) -> RecorderHandle {
        let mut subscription =
            bus.subscribe(Filter::all().topics([Topic::Results, Topic::Status]).job(job));
        let (handled_tx, handled_rx) = watch::channel(0u64);

        let task = tokio::spawn(async move {
            let mut handled = 0u64;
            let mut failed = false;

            while let Some(message) = subscription.recv().await {
                match message.payload {
                    Payload::Results(row) => {
                        if !failed {
                            let appended = results.lock().append(&row);
                            match appended {
                                Ok(warnings) => {
                                    for warning in warnings {
                                        log.warn(warning);
                                    }
                                }
                                Err(e) => {
                                    failed = true;
                                    let reason = format!("recording failed: {e}");
                                    control.fault(reason.clone());
                                    log.error(reason);
                                    control.stop_token().request_stop();
                                }
                            }
                        }
                        handled += 1;
                        handled_tx.send_replace(handled);
                    }
                    Payload::Status(status) if status.is_terminal() => {
                        let finished = results.lock().finish();
                        if let Err(e) = finished {
                            if !failed {
                                log.error(format!("failed to finalize results: {e}"));
                            }
                        }
                        break;
                    }
                    _ => {}
                }
            }
            debug!(job = %job, rows = handled, "recorder stopped");
        });

        RecorderHandle {
            handled: handled_rx,
            task,
        }
    }
}

/// Join handle plus progress counter of a running recorder.
#[derive(Debug)]
pub struct RecorderHandle {
    handled: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl RecorderHandle {
    /// Rows handled (written or skipped after a fault) so far.
    pub fn handled(&self) -> u64 {
        *self.handled.borrow()
    }

    /// Wait until at least `emitted` rows have been handled.
    ///
    /// Returns early if the recorder has stopped.
    pub async fn drained(&mut self, emitted: u64) {
        let _ = self.handled.wait_for(|n| *n >= emitted).await;
    }

    /// Wait for the task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!("recorder task ended abnormally: {e}");
        }
    }
}
