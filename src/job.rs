//! Jobs: one procedure, one results file and one worker, queued as a unit.

use crate::bus::EventBus;
use crate::error::AppResult;
use crate::messages::{Message, Payload};
use crate::procedure::{Procedure, Status};
use crate::results::Results;
use crate::worker::{JobControl, Worker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell jobs apart in logs.
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// A queued unit of work.
///
/// Built once the procedure's parameters are bound and its results file has
/// been created; from then on the procedure is only touched by its worker.
pub struct Job {
    id: JobId,
    name: String,
    worker: Worker,
    results: Arc<Mutex<Results>>,
    results_path: Option<PathBuf>,
    status: Arc<watch::Sender<Status>>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("results_path", &self.results_path)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl Job {
    /// Bundle `procedure` with its already-created `results`.
    pub fn new(procedure: impl Procedure, results: Results) -> Self {
        Self::from_boxed(Box::new(procedure), results)
    }

    /// Same as [`Job::new`] for a boxed procedure.
    pub fn from_boxed(procedure: Box<dyn Procedure>, results: Results) -> Self {
        let id = JobId::new();
        let name = procedure.name().to_string();
        let results_path = results.path().map(Path::to_path_buf);
        let (status, _) = watch::channel(Status::Queued);
        Self {
            id,
            name,
            worker: Worker::new(id, procedure),
            results: Arc::new(Mutex::new(results)),
            results_path,
            status: Arc::new(status),
        }
    }

    /// Create the results file at `path` and bundle it with `procedure`.
    pub fn create(procedure: impl Procedure, path: impl AsRef<Path>) -> AppResult<Self> {
        let results = Results::create(path, &procedure)?;
        Ok(Self::new(procedure, results))
    }

    /// Job identifier.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Procedure name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status.
    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// Results file, when file-backed.
    pub fn results_path(&self) -> Option<&Path> {
        self.results_path.as_deref()
    }

    /// Handle observing this job.
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            name: self.name.clone(),
            status: self.status.subscribe(),
            results_path: self.results_path.clone(),
        }
    }

    /// Listing entry.
    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            name: self.name.clone(),
            status: self.status(),
            results_path: self.results_path.clone(),
        }
    }

    /// Start the worker on its own task.
    pub fn launch(self, bus: &EventBus) -> RunningJob {
        let info = self.info();
        let control = self.worker.control();
        let status = self.status.subscribe();
        let task = tokio::spawn(self.worker.run(
            self.results,
            bus.clone(),
            Arc::clone(&self.status),
        ));
        RunningJob {
            info,
            control,
            status,
            sender: self.status,
            bus: bus.clone(),
            task,
        }
    }
}

/// A job whose worker task has been spawned.
#[derive(Debug)]
pub struct RunningJob {
    info: JobInfo,
    control: Arc<JobControl>,
    status: watch::Receiver<Status>,
    sender: Arc<watch::Sender<Status>>,
    bus: EventBus,
    task: JoinHandle<Status>,
}

impl RunningJob {
    /// Job identifier.
    pub fn id(&self) -> JobId {
        self.info.id
    }

    /// Listing entry with the live status.
    pub fn info(&self) -> JobInfo {
        JobInfo {
            status: *self.status.borrow(),
            ..self.info.clone()
        }
    }

    /// Stop/fault control block.
    pub fn control(&self) -> &Arc<JobControl> {
        &self.control
    }

    /// Status channel.
    pub fn status(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Wait for the worker to finish.
    ///
    /// A worker task that died outside the lifecycle guards counts as `FAILED`.
    /// That status is then published on the bus (which also ends the job's
    /// recorder) and to the job's handles.
    pub async fn join(self) -> Status {
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(job = %self.info.id, "worker task died: {e}");
                self.bus
                    .publish(Message::new(self.info.id, Payload::Status(Status::Failed)));
                self.sender.send_replace(Status::Failed);
                Status::Failed
            }
        }
    }
}

/// Snapshot of a job for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Job identifier.
    pub id: JobId,
    /// Procedure name.
    pub name: String,
    /// Status at the time of the snapshot.
    pub status: Status,
    /// Results file, when file-backed.
    pub results_path: Option<PathBuf>,
}

/// Caller-side view of a queued job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    name: String,
    status: watch::Receiver<Status>,
    results_path: Option<PathBuf>,
}

impl JobHandle {
    /// Job identifier.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Procedure name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest status.
    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// Results file, when file-backed.
    pub fn results_path(&self) -> Option<&Path> {
        self.results_path.as_deref()
    }

    /// Wait for a terminal status.
    ///
    /// Returns `None` if the job was dropped before it ran (`remove()`,
    /// `clear_queued()` or `shutdown()`). A launched job always resolves, with
    /// `FAILED` if its worker task died.
    pub async fn wait(&mut self) -> Option<Status> {
        self.status
            .wait_for(Status::is_terminal)
            .await
            .ok()
            .map(|status| *status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataSet;
    use crate::parameter::ParameterSet;
    use crate::procedure::{Column, ExecutionContext};
    use async_trait::async_trait;

    /// Panics while the worker prepares it, outside any lifecycle call.
    struct Broken {
        parameters: ParameterSet,
    }

    #[async_trait]
    impl Procedure for Broken {
        fn name(&self) -> &str {
            "Broken"
        }
        fn parameters(&self) -> &ParameterSet {
            &self.parameters
        }
        fn metadata(&self) -> MetadataSet {
            panic!("metadata unavailable");
        }
        fn columns(&self) -> Vec<Column> {
            vec![Column::new("X")]
        }
        async fn execute(&mut self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn broken_job() -> Job {
        let procedure = Broken {
            parameters: ParameterSet::new(),
        };
        let results = Results::from_writer("memory", &procedure, Vec::new()).unwrap();
        Job::new(procedure, results)
    }

    #[test]
    fn display_is_short() {
        let id = JobId::new();
        assert_eq!(id.to_string().len(), 8);
    }

    #[tokio::test]
    async fn dead_worker_reports_failed_to_handles() {
        let job = broken_job();
        let mut handle = job.handle();
        let bus = EventBus::local();
        let mut statuses = bus.subscribe(crate::bus::Filter::all().job(job.id()));
        let running = job.launch(&bus);
        assert_eq!(running.join().await, Status::Failed);
        assert_eq!(handle.wait().await, Some(Status::Failed));

        let mut seen = Vec::new();
        while let Some(message) = statuses.try_recv() {
            if let Payload::Status(status) = message.payload {
                seen.push(status);
            }
        }
        assert_eq!(seen, vec![Status::Running, Status::Failed]);
    }

    #[tokio::test]
    async fn dropped_job_resolves_to_none() {
        let job = broken_job();
        let mut handle = job.handle();
        assert_eq!(handle.status(), Status::Queued);
        drop(job);
        assert_eq!(handle.wait().await, None);
    }
}
