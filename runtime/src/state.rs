//! Runtime state and the descriptor that carries it between processes.
//!
//! A [`RuntimeDescriptor`] names where each cluster service lives. It travels
//! as an opaque token (URL-safe base64 over versioned JSON) on worker command
//! lines and in subscription requests. A [`Resolver`] turns a descriptor back
//! into live service handles.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use stratus_types::{ClusterId, Locator, NodeAddress};

use crate::cancellation::PrimitivesFactory;
use crate::error::RuntimeError;
use crate::jobs::{Job, JobQueue, ResultCell, Submission, TaskManager, TaskStatus, WorkerManager};
use crate::logging::LoggerSink;
use crate::resources::ResourceRegistry;

/// Endpoint names every driver node binds its services under.
pub mod endpoints {
    pub const PRIMITIVES: &str = "stratus.primitives";
    pub const WORKER_REGISTRY: &str = "stratus.workers";
    pub const JOB_QUEUE: &str = "stratus.jobs";
    pub const TASK_MANAGER: &str = "stratus.tasks";
    pub const LOGGER: &str = "stratus.logger";
    /// Bound on every node that can be subscribed as a remote worker.
    pub const WORKER_MANAGER: &str = "stratus.worker-manager";
}

const TOKEN_MAGIC: &str = "stratus-runtime";
const TOKEN_VERSION: u32 = 1;

/// Serializable handle to a running cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    cluster: ClusterId,
    primitives: Locator,
    worker_manager: Locator,
    job_queue: Locator,
    task_manager: Locator,
    logger: Locator,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireToken {
    magic: String,
    version: u32,
    descriptor: RuntimeDescriptor,
}

impl RuntimeDescriptor {
    /// Descriptor for a cluster whose services are all hosted at `address`.
    #[must_use]
    pub fn hosted_at(cluster: ClusterId, address: &NodeAddress) -> Self {
        let at = |endpoint: &str| Locator::new(address.clone(), endpoint);
        Self {
            cluster,
            primitives: at(endpoints::PRIMITIVES),
            worker_manager: at(endpoints::WORKER_REGISTRY),
            job_queue: at(endpoints::JOB_QUEUE),
            task_manager: at(endpoints::TASK_MANAGER),
            logger: at(endpoints::LOGGER),
        }
    }

    #[must_use]
    pub fn cluster(&self) -> ClusterId {
        self.cluster
    }

    #[must_use]
    pub fn primitives(&self) -> &Locator {
        &self.primitives
    }

    #[must_use]
    pub fn worker_manager(&self) -> &Locator {
        &self.worker_manager
    }

    #[must_use]
    pub fn job_queue(&self) -> &Locator {
        &self.job_queue
    }

    #[must_use]
    pub fn task_manager(&self) -> &Locator {
        &self.task_manager
    }

    #[must_use]
    pub fn logger(&self) -> &Locator {
        &self.logger
    }

    /// Encode as a token safe to pass as a single command-line argument.
    pub fn encode(&self) -> Result<String, RuntimeError> {
        let wire = WireToken {
            magic: TOKEN_MAGIC.to_string(),
            version: TOKEN_VERSION,
            descriptor: self.clone(),
        };
        let json = serde_json::to_vec(&wire).map_err(|e| {
            RuntimeError::Serialization(format!("encoding descriptor for {}: {e}", self.cluster))
        })?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> Result<Self, RuntimeError> {
        if token.is_empty() {
            return Err(RuntimeError::MalformedDescriptor("empty token".to_string()));
        }
        let json = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| RuntimeError::MalformedDescriptor(format!("invalid encoding: {e}")))?;
        let wire: WireToken = serde_json::from_slice(&json)
            .map_err(|e| RuntimeError::MalformedDescriptor(format!("invalid payload: {e}")))?;
        if wire.magic != TOKEN_MAGIC {
            return Err(RuntimeError::MalformedDescriptor(format!(
                "unrecognized token kind '{}'",
                wire.magic
            )));
        }
        if wire.version != TOKEN_VERSION {
            return Err(RuntimeError::MalformedDescriptor(format!(
                "unsupported token version {} (expected {TOKEN_VERSION})",
                wire.version
            )));
        }
        Ok(wire.descriptor)
    }
}

/// Live handles to the services a descriptor names.
#[derive(Clone)]
pub struct ClusterServices {
    pub primitives: Arc<dyn PrimitivesFactory>,
    pub worker_manager: Arc<dyn WorkerManager>,
    pub job_queue: Arc<dyn JobQueue>,
    pub task_manager: Arc<dyn TaskManager>,
    pub logger: Arc<dyn LoggerSink>,
    /// Resources every process attached to this cluster starts with.
    pub resources: ResourceRegistry,
}

/// Turns descriptors into live service handles.
pub trait Resolver: Send + Sync {
    fn resolve(&self, descriptor: &RuntimeDescriptor) -> Result<ClusterServices, RuntimeError>;
}

/// Resolver for clusters hosted in this process.
#[derive(Default)]
pub struct LocalDirectory {
    clusters: RwLock<HashMap<ClusterId, (RuntimeDescriptor, ClusterServices)>>,
}

impl LocalDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn global() -> &'static LocalDirectory {
        static GLOBAL: OnceLock<LocalDirectory> = OnceLock::new();
        GLOBAL.get_or_init(LocalDirectory::new)
    }

    pub fn register(&self, descriptor: RuntimeDescriptor, services: ClusterServices) {
        tracing::debug!(cluster = %descriptor.cluster(), "Registering cluster in local directory");
        self.clusters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(descriptor.cluster(), (descriptor, services));
    }

    pub fn unregister(&self, cluster: ClusterId) -> bool {
        self.clusters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cluster)
            .is_some()
    }

    #[must_use]
    pub fn contains(&self, cluster: ClusterId) -> bool {
        self.clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&cluster)
    }
}

impl Resolver for LocalDirectory {
    fn resolve(&self, descriptor: &RuntimeDescriptor) -> Result<ClusterServices, RuntimeError> {
        let clusters = self.clusters.read().unwrap_or_else(PoisonError::into_inner);
        let (registered, services) = clusters.get(&descriptor.cluster()).ok_or_else(|| {
            RuntimeError::InvalidState(format!(
                "cluster {} is not hosted in this process",
                descriptor.cluster()
            ))
        })?;
        if registered != descriptor {
            return Err(RuntimeError::InvalidState(format!(
                "descriptor for cluster {} does not match the hosted services",
                descriptor.cluster()
            )));
        }
        Ok(services.clone())
    }
}

/// A descriptor together with the live services it names.
pub struct RuntimeState {
    descriptor: RuntimeDescriptor,
    services: ClusterServices,
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl RuntimeState {
    #[must_use]
    pub fn new(descriptor: RuntimeDescriptor, services: ClusterServices) -> Self {
        Self {
            descriptor,
            services,
        }
    }

    pub fn resolve(descriptor: RuntimeDescriptor, resolver: &dyn Resolver) -> Result<Self, RuntimeError> {
        let services = resolver.resolve(&descriptor)?;
        Ok(Self::new(descriptor, services))
    }

    pub fn from_token(token: &str, resolver: &dyn Resolver) -> Result<Self, RuntimeError> {
        Self::resolve(RuntimeDescriptor::decode(token)?, resolver)
    }

    pub fn to_token(&self) -> Result<String, RuntimeError> {
        self.descriptor.encode()
    }

    #[must_use]
    pub fn descriptor(&self) -> &RuntimeDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn primitives(&self) -> &Arc<dyn PrimitivesFactory> {
        &self.services.primitives
    }

    #[must_use]
    pub fn worker_manager(&self) -> &Arc<dyn WorkerManager> {
        &self.services.worker_manager
    }

    #[must_use]
    pub fn job_queue(&self) -> &Arc<dyn JobQueue> {
        &self.services.job_queue
    }

    #[must_use]
    pub fn task_manager(&self) -> &Arc<dyn TaskManager> {
        &self.services.task_manager
    }

    #[must_use]
    pub fn logger(&self) -> &Arc<dyn LoggerSink> {
        &self.services.logger
    }

    #[must_use]
    pub fn resources(&self) -> &ResourceRegistry {
        &self.services.resources
    }

    /// Create a task for `submission`, enqueue it, and return its result cell.
    pub async fn start_as_cell(&self, submission: Submission) -> Result<ResultCell, RuntimeError> {
        let task_manager = &self.services.task_manager;
        let (task, sink, cell) = task_manager.create_task(&submission.process).await?;
        task_manager.set_status(task, TaskStatus::Pending);

        let process = submission.process.id();
        self.services
            .job_queue
            .enqueue(Job::new(submission, task, sink))
            .await?;
        tracing::debug!(%task, %process, "Task enqueued");
        Ok(cell)
    }
}
