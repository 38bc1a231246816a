//! In-process implementations of the cluster services.
//!
//! These back a locally hosted cluster. The job queue executes every job in
//! this process; workers that join contribute registry entries and log lines.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use stratus_types::{CancellationId, ProcessInfo, TaskId, WorkerRecord};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::RuntimeFut;
use crate::cancellation::{CancellationEntry, CancellationScope, PrimitivesFactory};
use crate::error::RuntimeError;
use crate::jobs::{
    Job, JobOutcome, JobQueue, ResultCell, ResultSink, TaskManager, TaskStatus, WorkerManager,
    result_cell,
};
use crate::logging::{LoggerSink, NullLogger};
use crate::resources::ResourceRegistry;
use crate::state::ClusterServices;
use crate::store::StoreProvider;
use crate::workflow::ExecutionContext;

/// Cancelled entries and finished tasks kept around for late status queries.
pub const DEFAULT_RETENTION: usize = 1024;

#[derive(Default)]
struct EntryTable {
    live: HashMap<CancellationId, CancellationScope>,
    /// Cancelled ids, oldest first.
    retired: VecDeque<CancellationId>,
}

impl EntryTable {
    fn retire(&mut self, id: CancellationId, retention: usize) {
        if self.live.remove(&id).is_some() {
            self.retired.push_back(id);
        }
        while self.retired.len() > retention {
            self.retired.pop_front();
        }
    }
}

struct LocalCancellationEntry {
    id: CancellationId,
    token: CancellationToken,
    done: AtomicBool,
    cancelled: Arc<AtomicUsize>,
    table: Weak<Mutex<EntryTable>>,
    retention: usize,
}

impl CancellationEntry for LocalCancellationEntry {
    fn id(&self) -> CancellationId {
        self.id
    }

    fn cancel(&self) -> RuntimeFut<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            if !self.done.swap(true, Ordering::AcqRel) {
                self.token.cancel();
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                if let Some(table) = self.table.upgrade() {
                    table
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .retire(self.id, self.retention);
                }
                tracing::debug!(entry = %self.id, "Cancellation entry cancelled");
            }
            Ok(())
        })
    }

    fn is_cancellation_requested(&self) -> RuntimeFut<'_, Result<bool, RuntimeError>> {
        Box::pin(async move { Ok(self.token.is_cancelled()) })
    }

    fn cancelled(&self) -> RuntimeFut<'_, ()> {
        Box::pin(self.token.cancelled())
    }
}

/// Cancellation entries held in this process.
///
/// An entry leaves the table when it is cancelled. The most recent
/// cancelled ids are remembered, so a late lookup still reports the entry
/// as cancelled instead of unknown.
pub struct InMemoryPrimitives {
    table: Arc<Mutex<EntryTable>>,
    retention: usize,
    created: AtomicUsize,
    cancelled: Arc<AtomicUsize>,
}

impl Default for InMemoryPrimitives {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl InMemoryPrimitives {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember at most `retention` cancelled ids.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(EntryTable::default())),
            retention,
            created: AtomicUsize::new(0),
            cancelled: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn entry(&self, id: CancellationId, token: CancellationToken, done: bool) -> CancellationScope {
        CancellationScope::new(Arc::new(LocalCancellationEntry {
            id,
            token,
            done: AtomicBool::new(done),
            cancelled: Arc::clone(&self.cancelled),
            table: Arc::downgrade(&self.table),
            retention: self.retention,
        }))
    }

    /// Create an entry without going through the async factory interface.
    #[must_use]
    pub fn create(&self) -> CancellationScope {
        let scope = self.entry(CancellationId::new(), CancellationToken::new(), false);
        self.created.fetch_add(1, Ordering::Relaxed);
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .insert(scope.id(), scope.clone());
        scope
    }

    /// A live entry, or an already-cancelled stand-in for a retired one.
    #[must_use]
    pub fn lookup(&self, id: CancellationId) -> Option<CancellationScope> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(scope) = table.live.get(&id) {
            return Some(scope.clone());
        }
        if !table.retired.contains(&id) {
            return None;
        }
        drop(table);
        let token = CancellationToken::new();
        token.cancel();
        Some(self.entry(id, token, true))
    }

    /// Entries created and not yet cancelled.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .len()
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Entries that transitioned to cancelled. Repeat cancels are not counted.
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl PrimitivesFactory for InMemoryPrimitives {
    fn create_cancellation_entry(&self) -> RuntimeFut<'_, Result<CancellationScope, RuntimeError>> {
        Box::pin(async move { Ok(self.create()) })
    }
}

#[derive(Default)]
struct TaskTable {
    statuses: HashMap<TaskId, TaskStatus>,
    /// Tasks in a terminal status, oldest first.
    finished: VecDeque<TaskId>,
}

/// Task statuses held in this process.
///
/// Only the most recent finished tasks are kept; older ones are forgotten
/// and report no status.
pub struct InMemoryTaskManager {
    tasks: Mutex<TaskTable>,
    retention: usize,
}

impl Default for InMemoryTaskManager {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl InMemoryTaskManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` finished tasks.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            tasks: Mutex::new(TaskTable::default()),
            retention,
        }
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .statuses
            .len()
    }
}

impl TaskManager for InMemoryTaskManager {
    fn create_task<'a>(
        &'a self,
        process: &'a ProcessInfo,
    ) -> RuntimeFut<'a, Result<(TaskId, ResultSink, ResultCell), RuntimeError>> {
        Box::pin(async move {
            let task = TaskId::new();
            let (sink, cell) = result_cell(task);
            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .statuses
                .insert(task, TaskStatus::Pending);
            tracing::debug!(%task, process = %process.id(), "Task created");
            Ok((task, sink, cell))
        })
    }

    fn set_status(&self, task: TaskId, status: TaskStatus) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = tasks.statuses.insert(task, status);
        if !status.is_terminal() || previous.is_some_and(TaskStatus::is_terminal) {
            return;
        }
        tasks.finished.push_back(task);
        while tasks.finished.len() > self.retention {
            if let Some(evicted) = tasks.finished.pop_front() {
                tasks.statuses.remove(&evicted);
            }
        }
    }

    fn status(&self, task: TaskId) -> Option<TaskStatus> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .statuses
            .get(&task)
            .copied()
    }
}

/// Job queue that runs each job on this process's Tokio runtime.
///
/// An attempt that panics is a fault and is retried according to the job's
/// fault policy. Cancelling the job's scope aborts the running attempt.
/// Dropping the queue aborts every job still running.
pub struct InMemoryJobQueue {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    dispatcher: JoinHandle<()>,
}

impl InMemoryJobQueue {
    /// Start the dispatcher. Must be called within a Tokio runtime.
    #[must_use]
    pub fn start(tasks: Arc<dyn TaskManager>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let dispatcher_pending = Arc::clone(&pending);

        let dispatcher = tokio::spawn(async move {
            let mut running = JoinSet::new();
            loop {
                tokio::select! {
                    job = rx.recv() => {
                        let Some(job) = job else { break };
                        dispatcher_pending.fetch_sub(1, Ordering::AcqRel);
                        running.spawn(run_job(job, Arc::clone(&tasks)));
                    }
                    Some(_) = running.join_next(), if !running.is_empty() => {}
                }
            }
            while running.join_next().await.is_some() {}
        });

        Self {
            tx,
            pending,
            dispatcher,
        }
    }
}

impl Drop for InMemoryJobQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: Job) -> RuntimeFut<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.pending.fetch_add(1, Ordering::AcqRel);
            self.tx.send(job).map_err(|_| {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                RuntimeError::InvalidState("job queue has shut down".to_string())
            })
        })
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

async fn run_job(job: Job, tasks: Arc<dyn TaskManager>) {
    let Job {
        task,
        process,
        scope,
        policy,
        body,
        resources,
        logger,
        sink,
        ..
    } = job;
    let logger: Arc<dyn LoggerSink> = Arc::new(logger);
    let mut faults = 0_u32;

    let outcome: JobOutcome = loop {
        if scope.is_cancellation_requested().await.unwrap_or(false) {
            break Err(RuntimeError::Cancelled.into());
        }

        tasks.set_status(task, TaskStatus::Running { attempt: faults + 1 });
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new(
            process.clone(),
            token.clone(),
            resources.clone(),
            Arc::clone(&logger),
        );
        let mut attempt = tokio::spawn(body(ctx));

        let joined = tokio::select! {
            joined = &mut attempt => joined,
            () = scope.cancelled() => {
                token.cancel();
                attempt.abort();
                break Err(RuntimeError::Cancelled.into());
            }
        };

        match joined {
            Ok(result) => break result,
            Err(e) if e.is_panic() => {
                faults += 1;
                let Some(delay) = policy.retry_after(faults) else {
                    tracing::warn!(%task, faults, "Task faulted; fault policy exhausted");
                    break Err(RuntimeError::Faulted { faults }.into());
                };
                tracing::warn!(%task, faults, ?delay, "Task faulted; retrying");
                tasks.set_status(task, TaskStatus::Faulted { faults });
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = scope.cancelled() => break Err(RuntimeError::Cancelled.into()),
                }
            }
            Err(_) => break Err(RuntimeError::Cancelled.into()),
        }
    };

    let status = match &outcome {
        Ok(_) => TaskStatus::Completed,
        Err(e) if e.downcast_ref::<RuntimeError>().is_some_and(RuntimeError::is_cancelled) => {
            TaskStatus::Cancelled
        }
        Err(_) => TaskStatus::Failed,
    };
    tasks.set_status(task, status);
    if !sink.set(outcome) {
        tracing::debug!(%task, "Result dropped; no reader");
    }
}

#[derive(Default)]
pub struct InMemoryWorkerManager {
    workers: RwLock<Vec<WorkerRecord>>,
}

impl InMemoryWorkerManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerManager for InMemoryWorkerManager {
    fn register(&self, worker: WorkerRecord) -> RuntimeFut<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            tracing::info!(identity = %worker.identity, host = %worker.hostname, "Worker registered");
            let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
            match workers.iter_mut().find(|w| w.identity == worker.identity) {
                Some(existing) => *existing = worker,
                None => workers.push(worker),
            }
            Ok(())
        })
    }

    fn unregister<'a>(&'a self, identity: &'a str) -> RuntimeFut<'a, Result<bool, RuntimeError>> {
        Box::pin(async move {
            let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
            let before = workers.len();
            workers.retain(|w| w.identity != identity);
            let removed = workers.len() != before;
            if removed {
                tracing::info!(identity, "Worker unregistered");
            }
            Ok(removed)
        })
    }

    fn workers(&self) -> RuntimeFut<'_, Result<Vec<WorkerRecord>, RuntimeError>> {
        Box::pin(async move {
            Ok(self
                .workers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone())
        })
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }
}

impl StoreProvider for InMemoryStore {
    fn id(&self) -> &'static str {
        "memory"
    }

    fn create_unique_directory_path(&self) -> String {
        format!("processes/{}", Uuid::new_v4().simple())
    }

    fn create_unique_container_name(&self) -> String {
        format!("c{}", Uuid::new_v4().simple())
    }

    fn put<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> RuntimeFut<'a, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.blobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(path.to_string(), bytes);
            self.puts.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn get<'a>(&'a self, path: &'a str) -> RuntimeFut<'a, Result<Option<Vec<u8>>, RuntimeError>> {
        Box::pin(async move {
            Ok(self
                .blobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(path)
                .cloned())
        })
    }
}

/// Process-wide cache of shared objects, keyed by name.
#[derive(Default)]
pub struct ObjectCache {
    objects: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ObjectCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn global() -> Arc<ObjectCache> {
        static GLOBAL: OnceLock<Arc<ObjectCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ObjectCache::new())))
    }

    /// The cached object under `key`, if present and of type `T`.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let object = self
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;
        object.downcast::<T>().ok()
    }

    pub fn insert<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: Arc<T>) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fresh in-memory services with a no-op cluster logger.
///
/// Must be called within a Tokio runtime.
#[must_use]
pub fn in_memory_services(resources: ResourceRegistry) -> ClusterServices {
    let task_manager: Arc<dyn TaskManager> = Arc::new(InMemoryTaskManager::new());
    ClusterServices {
        primitives: Arc::new(InMemoryPrimitives::new()),
        worker_manager: Arc::new(InMemoryWorkerManager::new()),
        job_queue: Arc::new(InMemoryJobQueue::start(Arc::clone(&task_manager))),
        task_manager,
        logger: Arc::new(NullLogger),
        resources,
    }
}
