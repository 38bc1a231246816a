//! Worker lifecycle: spawning local worker processes, subscribing remote
//! worker nodes, and tearing both down.

use std::{io, mem};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use stratus_messaging::{Transport, call};
use stratus_types::{Locator, ManagerId, NodeAddress, WorkerRef};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::ExecutableSlot;
use crate::error::RuntimeError;
use crate::jobs::WorkerManager;
use crate::session::{SUBSCRIBE_METHOD, SubscribeRequest, SubscribeResponse};
use crate::state::{RuntimeDescriptor, endpoints};

pub const DEFAULT_SUBSCRIPTION_RETRIES: u32 = 3;
const SUBSCRIPTION_BACKOFF: Duration = Duration::from_millis(200);

/// A spawned worker process. Killed (with its process group on Unix) on drop.
struct LocalWorker {
    pid: u32,
    child: Option<Child>,
}

impl LocalWorker {
    fn spawn(executable: &Path, working_dir: &Path, token: &str) -> io::Result<Self> {
        let mut command = Command::new(executable);
        command
            .arg(token)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("worker exited before its pid was read"))?;
        Ok(Self {
            pid,
            child: Some(child),
        })
    }

    fn kill(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        #[cfg(unix)]
        {
            // SAFETY: killpg only signals; the group id is the pid of a child
            // spawned into its own process group.
            let killed = unsafe { libc::killpg(self.pid as i32, libc::SIGKILL) } == 0;
            if !killed && let Err(e) = child.start_kill() {
                tracing::debug!(pid = self.pid, error = %e, "Worker already gone");
            }
        }
        #[cfg(not(unix))]
        if let Err(e) = child.start_kill() {
            tracing::debug!(pid = self.pid, error = %e, "Worker already gone");
        }
        let _ = child.try_wait();
    }
}

impl Drop for LocalWorker {
    fn drop(&mut self) {
        self.kill();
    }
}

enum LiveWorker {
    Local(LocalWorker),
    Remote(ManagerId),
}

impl LiveWorker {
    fn worker_ref(&self) -> WorkerRef {
        match self {
            Self::Local(worker) => WorkerRef::Local(worker.pid),
            Self::Remote(manager) => WorkerRef::Remote(manager.clone()),
        }
    }
}

/// Tracks every worker this driver started or subscribed.
///
/// All mutations of the worker set go through one async lock, so concurrent
/// spawn, attach and kill calls never interleave. Dropping the pool kills
/// local workers.
pub struct WorkerPool {
    executable: Arc<ExecutableSlot>,
    transport: Arc<dyn Transport>,
    subscription_retries: u32,
    registry: Option<Arc<dyn WorkerManager>>,
    workers: Mutex<Vec<LiveWorker>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        executable: Arc<ExecutableSlot>,
        transport: Arc<dyn Transport>,
        subscription_retries: u32,
    ) -> Self {
        Self {
            executable,
            transport,
            subscription_retries,
            registry: None,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Registry that killed local workers are removed from.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn WorkerManager>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn executable(&self) -> &Arc<ExecutableSlot> {
        &self.executable
    }

    /// Spawn `count` worker processes, each given the descriptor token as its
    /// only argument and the executable's directory as working directory.
    ///
    /// If any spawn fails, the processes this call already started are killed
    /// and the worker set is left unchanged.
    pub async fn spawn_local_workers(
        &self,
        descriptor: &RuntimeDescriptor,
        count: i64,
    ) -> Result<Vec<WorkerRef>, RuntimeError> {
        if count < 1 {
            return Err(RuntimeError::InvalidArgument(format!(
                "worker count must be at least 1, got {count}"
            )));
        }
        let executable = self.executable.get()?;
        let working_dir = executable.parent().ok_or_else(|| {
            RuntimeError::InvalidState(format!(
                "worker executable {} has no parent directory",
                executable.display()
            ))
        })?;
        let token = descriptor.encode()?;

        let mut workers = self.workers.lock().await;
        let mut spawned = Vec::new();
        for _ in 0..count {
            match LocalWorker::spawn(executable, working_dir, &token) {
                Ok(worker) => spawned.push(worker),
                Err(source) => {
                    tracing::warn!(
                        path = %executable.display(),
                        started = spawned.len(),
                        error = %source,
                        "Worker spawn failed; killing workers started by this call"
                    );
                    drop(spawned);
                    return Err(RuntimeError::Spawn {
                        path: executable.to_path_buf(),
                        source,
                    });
                }
            }
        }

        let refs: Vec<WorkerRef> = spawned.iter().map(|w| WorkerRef::Local(w.pid)).collect();
        workers.extend(spawned.into_iter().map(LiveWorker::Local));
        tracing::info!(
            cluster = %descriptor.cluster(),
            count = refs.len(),
            total = workers.len(),
            "Spawned local workers"
        );
        Ok(refs)
    }

    /// Subscribe each node in `addresses` as a worker.
    ///
    /// Each subscription is retried on connectivity errors with linear
    /// backoff. Workers that acknowledged before a failure stay attached.
    pub async fn attach_remote_workers(
        &self,
        descriptor: &RuntimeDescriptor,
        addresses: &[NodeAddress],
    ) -> Result<Vec<WorkerRef>, RuntimeError> {
        let request = SubscribeRequest {
            token: descriptor.encode()?,
            retries: self.subscription_retries,
        };

        let mut workers = self.workers.lock().await;
        let mut attached = Vec::with_capacity(addresses.len());
        for address in addresses {
            let manager = self.subscribe(address, &request).await?;
            tracing::info!(%address, identity = %manager, "Remote worker attached");
            attached.push(WorkerRef::Remote(manager.clone()));
            workers.push(LiveWorker::Remote(manager));
        }
        Ok(attached)
    }

    async fn subscribe(
        &self,
        address: &NodeAddress,
        request: &SubscribeRequest,
    ) -> Result<ManagerId, RuntimeError> {
        let locator = Locator::new(address.clone(), endpoints::WORKER_MANAGER);
        let attempts = self.subscription_retries.saturating_add(1);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match call::<_, SubscribeResponse>(
                self.transport.as_ref(),
                &locator,
                SUBSCRIBE_METHOD,
                request,
            )
            .await
            {
                Ok(response) => return Ok(ManagerId::new(response.identity)),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(%address, attempt, error = %e, "Subscription attempt failed");
                    reason = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(SUBSCRIPTION_BACKOFF * attempt).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RuntimeError::WorkerUnreachable {
            address: address.clone(),
            attempts,
            reason,
        })
    }

    /// Kill local workers and forget remote ones. Idempotent; never fails.
    ///
    /// A killed process cannot unregister itself, so its record is removed
    /// from the registry here. Remote workers keep their registration.
    /// Returns how many workers were removed.
    pub async fn kill_all(&self) -> usize {
        let mut workers = self.workers.lock().await;
        let drained: Vec<LiveWorker> = mem::take(&mut *workers);
        let count = drained.len();
        for worker in drained {
            match worker {
                LiveWorker::Local(mut local) => {
                    tracing::debug!(pid = local.pid, "Killing local worker");
                    local.kill();
                    self.forget(&WorkerRef::Local(local.pid)).await;
                }
                LiveWorker::Remote(manager) => {
                    tracing::debug!(identity = %manager, "Detaching remote worker");
                }
            }
        }
        drop(workers);
        if count > 0 {
            tracing::info!(count, "Workers removed");
        }
        count
    }

    async fn forget(&self, worker: &WorkerRef) {
        let Some(registry) = &self.registry else {
            return;
        };
        let identity = worker.identity();
        if let Err(e) = registry.unregister(&identity).await {
            tracing::debug!(%identity, error = %e, "Could not unregister killed worker");
        }
    }

    /// Snapshot of the worker set, in the order workers were added.
    pub async fn current_workers(&self) -> Vec<WorkerRef> {
        self.workers
            .lock()
            .await
            .iter()
            .map(LiveWorker::worker_ref)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.lock().await.is_empty()
    }
}
