//! Jobs, result cells and the services that schedule them.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stratus_types::{FaultPolicy, ProcessInfo, TaskId, WorkerRecord};
use tokio::sync::oneshot;

use crate::RuntimeFut;
use crate::assembly::AssemblyId;
use crate::cancellation::CancellationScope;
use crate::error::RuntimeError;
use crate::logging::JobLogger;
use crate::resources::ResourceRegistry;
use crate::workflow::ExecutionContext;

/// Type-erased successful result of a job.
pub type ErasedValue = Box<dyn Any + Send>;

/// What a job attempt produces: a value or the workflow's own error.
pub type JobOutcome = anyhow::Result<ErasedValue>;

/// Entry point of a job. Called once per attempt.
pub type JobBody = Arc<dyn Fn(ExecutionContext) -> RuntimeFut<'static, JobOutcome> + Send + Sync>;

/// Write side of a [`ResultCell`]. Set at most once.
pub struct ResultSink {
    task: TaskId,
    tx: oneshot::Sender<JobOutcome>,
}

impl ResultSink {
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Deposit the outcome. Returns false if nobody is waiting any more.
    pub fn set(self, outcome: JobOutcome) -> bool {
        self.tx.send(outcome).is_ok()
    }
}

/// Read side of a task's result.
pub struct ResultCell {
    task: TaskId,
    rx: oneshot::Receiver<JobOutcome>,
}

impl fmt::Debug for ResultCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCell").field("task", &self.task).finish()
    }
}

impl ResultCell {
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    pub async fn await_result(self) -> JobOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RuntimeError::InvalidState(format!(
                "task {} ended without depositing a result",
                self.task
            ))
            .into()),
        }
    }
}

#[must_use]
pub fn result_cell(task: TaskId) -> (ResultSink, ResultCell) {
    let (tx, rx) = oneshot::channel();
    (ResultSink { task, tx }, ResultCell { task, rx })
}

/// Everything the driver hands to [`RuntimeState::start_as_cell`](crate::RuntimeState::start_as_cell).
pub struct Submission {
    pub process: ProcessInfo,
    pub dependencies: Vec<AssemblyId>,
    pub scope: CancellationScope,
    pub policy: FaultPolicy,
    pub body: JobBody,
    pub resources: ResourceRegistry,
    pub logger: JobLogger,
}

/// A submission bound to a task and its result sink.
pub struct Job {
    pub task: TaskId,
    pub process: ProcessInfo,
    pub dependencies: Vec<AssemblyId>,
    pub scope: CancellationScope,
    pub policy: FaultPolicy,
    pub body: JobBody,
    pub resources: ResourceRegistry,
    pub logger: JobLogger,
    pub sink: ResultSink,
}

impl Job {
    #[must_use]
    pub fn new(submission: Submission, task: TaskId, sink: ResultSink) -> Self {
        let Submission {
            process,
            dependencies,
            scope,
            policy,
            body,
            resources,
            logger,
        } = submission;
        Self {
            task,
            process,
            dependencies,
            scope,
            policy,
            body,
            resources,
            logger,
            sink,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running { attempt: u32 },
    /// The last attempt faulted and a retry is scheduled.
    Faulted { faults: u32 },
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Accepts jobs for execution.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Job) -> RuntimeFut<'_, Result<(), RuntimeError>>;
    /// Jobs accepted but not yet picked up.
    fn pending(&self) -> usize;
}

/// Allocates tasks and tracks their status.
pub trait TaskManager: Send + Sync {
    fn create_task<'a>(
        &'a self,
        process: &'a ProcessInfo,
    ) -> RuntimeFut<'a, Result<(TaskId, ResultSink, ResultCell), RuntimeError>>;
    fn set_status(&self, task: TaskId, status: TaskStatus);
    fn status(&self, task: TaskId) -> Option<TaskStatus>;
}

/// Registry of workers that joined the cluster.
pub trait WorkerManager: Send + Sync {
    fn register(&self, worker: WorkerRecord) -> RuntimeFut<'_, Result<(), RuntimeError>>;
    /// Returns whether a worker with that identity was registered.
    fn unregister<'a>(&'a self, identity: &'a str) -> RuntimeFut<'a, Result<bool, RuntimeError>>;
    fn workers(&self) -> RuntimeFut<'_, Result<Vec<WorkerRecord>, RuntimeError>>;
}
