//! Single-active-job scheduler.
//!
//! The [`Manager`] is an actor: it owns the FIFO job queue and the running job
//! slot, and is only ever mutated from its own task. Callers talk to it through a
//! cloneable [`ManagerHandle`] that sends [`ManagerCommand`]s and awaits the
//! `oneshot` replies.
//!
//! ## Scheduling
//!
//! - At most one job is `RUNNING` at a time.
//! - `queue()` appends to the tail and starts the head immediately when idle.
//! - When the running job reaches a terminal status the next queued job is started,
//!   whatever that status was. With `pause_on_abort` the queue instead holds after
//!   an aborted job until [`ManagerHandle::resume`].
//! - `abort()` only asks the procedure to stop. A procedure that never polls its
//!   stop token keeps running, and the timed wait returns
//!   [`AbortOutcome::StillRunning`].
//!
//! ## Job completion
//!
//! Every launched job gets a small supervision task that awaits the worker and
//! reports back with [`ManagerCommand::JobFinished`]. The supervisor holds a sender
//! upgraded from a weak one, so the controller exits once every handle is gone and
//! no job is running.

use crate::bus::{EventBus, Filter, Subscription};
use crate::config::ManagerSettings;
use crate::error::{AppResult, DaqError};
use crate::job::{Job, JobHandle, JobId, JobInfo};
use crate::messages::ManagerCommand;
use crate::procedure::Status;
use crate::worker::JobControl;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Result of [`ManagerHandle::abort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The job reached this terminal status within the timeout.
    Stopped(Status),
    /// The timeout elapsed; the job is still running.
    StillRunning,
}

struct ActiveJob {
    info: JobInfo,
    control: Arc<JobControl>,
    status: watch::Receiver<Status>,
    abort_requested: bool,
}

/// The controller actor.
pub struct Manager {
    settings: ManagerSettings,
    bus: EventBus,
    queue: VecDeque<Job>,
    running: Option<ActiveJob>,
    paused: bool,
    /// Terminal status per completed job, kept only so `remove()` can answer
    /// `JobNotQueued` instead of `JobNotFound`. One small entry per job for the
    /// controller's lifetime.
    finished: HashMap<JobId, Status>,
    notify: mpsc::WeakSender<ManagerCommand>,
}

impl Manager {
    /// Start the controller task on `bus` and return a handle to it.
    pub fn spawn(settings: ManagerSettings, bus: EventBus) -> ManagerHandle {
        let (tx, rx) = mpsc::channel(settings.command_capacity.max(1));
        let manager = Manager {
            settings: settings.clone(),
            bus: bus.clone(),
            queue: VecDeque::new(),
            running: None,
            paused: false,
            finished: HashMap::new(),
            notify: tx.downgrade(),
        };
        tokio::spawn(manager.run(rx));
        ManagerHandle { tx, bus, settings }
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<ManagerCommand>) {
        info!("Manager started");

        while let Some(command) = command_rx.recv().await {
            match command {
                ManagerCommand::Queue { job, response } => {
                    let handle = job.handle();
                    info!(job = %job.id(), name = job.name(), "job queued");
                    self.queue.push_back(*job);
                    let _ = response.send(handle);
                    self.start_next();
                }

                ManagerCommand::Abort { response } => {
                    let result = self.abort();
                    let _ = response.send(result);
                }

                ManagerCommand::Resume { response } => {
                    self.paused = false;
                    let started = self.start_next();
                    let _ = response.send(started);
                }

                ManagerCommand::Remove { id, response } => {
                    let result = self.remove(id);
                    let _ = response.send(result);
                }

                ManagerCommand::ClearQueued { response } => {
                    let removed = self.queue.len();
                    self.queue.clear();
                    if removed > 0 {
                        info!("cleared {removed} queued job(s)");
                    }
                    let _ = response.send(removed);
                }

                ManagerCommand::List { response } => {
                    let mut jobs: Vec<JobInfo> =
                        self.running.iter().map(ActiveJob::info).collect();
                    jobs.extend(self.queue.iter().map(Job::info));
                    let _ = response.send(jobs);
                }

                ManagerCommand::JobFinished { id, status } => {
                    self.job_finished(id, status);
                }

                ManagerCommand::Shutdown { response } => {
                    if let Some(active) = &self.running {
                        active.control.request_stop();
                    }
                    self.queue.clear();
                    let _ = response.send(());
                    break;
                }
            }
        }

        info!("Manager stopped");
    }

    /// Launch the head of the queue if idle and not paused.
    fn start_next(&mut self) -> bool {
        if self.running.is_some() || self.paused {
            return false;
        }
        let Some(job) = self.queue.pop_front() else {
            return false;
        };

        let running = job.launch(&self.bus);
        let id = running.id();
        self.running = Some(ActiveJob {
            info: running.info(),
            control: Arc::clone(running.control()),
            status: running.status(),
            abort_requested: false,
        });

        match self.notify.upgrade() {
            Some(tx) => {
                tokio::spawn(async move {
                    let status = running.join().await;
                    if tx
                        .send(ManagerCommand::JobFinished { id, status })
                        .await
                        .is_err()
                    {
                        debug!(job = %id, "manager gone before job completion");
                    }
                });
            }
            None => warn!(job = %id, "manager is shutting down; completion will not be tracked"),
        }
        true
    }

    fn abort(&mut self) -> AppResult<watch::Receiver<Status>> {
        let active = self.running.as_mut().ok_or(DaqError::NothingRunning)?;
        info!(job = %active.info.id, "abort requested");
        active.abort_requested = true;
        active.control.request_stop();
        Ok(active.status.clone())
    }

    fn remove(&mut self, id: JobId) -> AppResult<()> {
        if let Some(index) = self.queue.iter().position(|job| job.id() == id) {
            if let Some(job) = self.queue.remove(index) {
                info!(job = %id, name = job.name(), "job removed from queue");
            }
            return Ok(());
        }
        if let Some(active) = self.running.as_ref().filter(|a| a.info.id == id) {
            return Err(DaqError::JobNotQueued {
                id,
                status: *active.status.borrow(),
            });
        }
        match self.finished.get(&id) {
            Some(status) => Err(DaqError::JobNotQueued {
                id,
                status: *status,
            }),
            None => Err(DaqError::JobNotFound(id)),
        }
    }

    fn job_finished(&mut self, id: JobId, status: Status) {
        if self.running.as_ref().map(|a| a.info.id) != Some(id) {
            warn!(job = %id, "completion for a job that is not running");
            return;
        }
        let Some(active) = self.running.take() else {
            return;
        };
        info!(job = %id, %status, "job completed");
        self.finished.insert(id, status);
        if active.abort_requested && status == Status::Aborted && self.settings.pause_on_abort {
            info!("queue paused after abort; call resume() to continue");
            self.paused = true;
        }
        self.start_next();
    }
}

impl ActiveJob {
    fn info(&self) -> JobInfo {
        JobInfo {
            status: *self.status.borrow(),
            ..self.info.clone()
        }
    }
}

/// Cloneable client of the manager.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<ManagerCommand>,
    bus: EventBus,
    settings: ManagerSettings,
}

impl ManagerHandle {
    async fn send(&self, command: ManagerCommand) -> AppResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| DaqError::ManagerStopped)
    }

    /// Append `job` to the queue; starts it at once when nothing is running.
    pub async fn queue(&self, job: Job) -> AppResult<JobHandle> {
        let (cmd, rx) = ManagerCommand::queue(job);
        self.send(cmd).await?;
        rx.await.map_err(|_| DaqError::ManagerStopped)
    }

    /// Ask the running job to stop and wait up to the configured timeout.
    pub async fn abort(&self) -> AppResult<AbortOutcome> {
        self.abort_with_timeout(self.settings.abort_timeout()).await
    }

    /// Ask the running job to stop and wait up to `timeout` (`None` waits forever).
    ///
    /// Returning [`AbortOutcome::StillRunning`] leaves the job running; the stop
    /// request stays in place.
    pub async fn abort_with_timeout(&self, timeout: Option<Duration>) -> AppResult<AbortOutcome> {
        let (cmd, rx) = ManagerCommand::abort();
        self.send(cmd).await?;
        let mut status = rx.await.map_err(|_| DaqError::ManagerStopped)??;

        let terminal = async { status.wait_for(Status::is_terminal).await.map(|s| *s) };
        let waited = match timeout {
            Some(limit) => match tokio::time::timeout(limit, terminal).await {
                Ok(waited) => waited,
                Err(_) => return Ok(AbortOutcome::StillRunning),
            },
            None => terminal.await,
        };
        Ok(AbortOutcome::Stopped(waited.unwrap_or(Status::Failed)))
    }

    /// Lift an abort pause and start the next queued job if idle.
    ///
    /// Returns whether a job was started.
    pub async fn resume(&self) -> AppResult<bool> {
        let (cmd, rx) = ManagerCommand::resume();
        self.send(cmd).await?;
        rx.await.map_err(|_| DaqError::ManagerStopped)
    }

    /// Drop a job that is still queued.
    ///
    /// The running job and jobs that already completed give
    /// [`DaqError::JobNotQueued`]; ids this manager never saw give
    /// [`DaqError::JobNotFound`].
    pub async fn remove(&self, id: JobId) -> AppResult<()> {
        let (cmd, rx) = ManagerCommand::remove(id);
        self.send(cmd).await?;
        rx.await.map_err(|_| DaqError::ManagerStopped)?
    }

    /// Drop every queued job; returns how many were removed.
    pub async fn clear_queued(&self) -> AppResult<usize> {
        let (cmd, rx) = ManagerCommand::clear_queued();
        self.send(cmd).await?;
        rx.await.map_err(|_| DaqError::ManagerStopped)
    }

    /// The running job (if any) followed by the queue.
    pub async fn list(&self) -> AppResult<Vec<JobInfo>> {
        let (cmd, rx) = ManagerCommand::list();
        self.send(cmd).await?;
        rx.await.map_err(|_| DaqError::ManagerStopped)
    }

    /// Ask the running job to stop, drop the queue and stop the controller.
    ///
    /// Does not wait for the running job.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (cmd, rx) = ManagerCommand::shutdown();
        self.send(cmd).await?;
        rx.await.map_err(|_| DaqError::ManagerStopped)
    }

    /// Bus the manager's jobs publish on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribe to the manager's bus.
    pub fn subscribe(&self, filter: Filter) -> Subscription {
        self.bus.subscribe(filter)
    }
}
