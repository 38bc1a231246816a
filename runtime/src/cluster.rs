//! Bootstrapping a locally hosted cluster.

use std::sync::Arc;
use std::time::Duration;

use stratus_messaging::{NodeServer, Router, TcpTransport};
use stratus_types::{ClusterId, FaultPolicy, NodeAddress, WorkerRef};
use tokio::runtime::Handle;

use crate::client::SubmissionClient;
use crate::config::{ClusterConfig, ExecutableSlot};
use crate::error::RuntimeError;
use crate::host::ClusterHost;
use crate::jobs::TaskManager;
use crate::logging::{LoggerSink, NullLogger};
use crate::manager::RuntimeManager;
use crate::memory::{
    InMemoryJobQueue, InMemoryPrimitives, InMemoryStore, InMemoryTaskManager,
    InMemoryWorkerManager,
};
use crate::resources::ResourceRegistry;
use crate::state::{ClusterServices, LocalDirectory, RuntimeDescriptor, RuntimeState};
use crate::store::{JsonSerializer, Serializer, StoreProvider};
use crate::workers::WorkerPool;
use crate::workflow::DependencyCompiler;

/// A cluster hosted by this process.
///
/// The driver node serves the cluster's services over TCP so that worker
/// processes and remote nodes can join it.
pub struct Cluster {
    node: NodeServer,
    token: String,
    manager: Arc<RuntimeManager>,
    client: SubmissionClient,
    workers: WorkerPool,
    primitives: Arc<InMemoryPrimitives>,
    default_policy: FaultPolicy,
}

impl Cluster {
    /// Start a cluster using the process-wide executable slot and no cluster logger.
    pub async fn init_local(config: ClusterConfig) -> Result<Self, RuntimeError> {
        Self::init_local_with(config, Arc::new(NullLogger), ExecutableSlot::global()).await
    }

    /// Start a cluster.
    ///
    /// `logger` receives the cluster log: lines from workers and job loggers.
    /// Workers are spawned and attached last; if that fails the node is
    /// stopped and any worker already started is killed.
    pub async fn init_local_with(
        config: ClusterConfig,
        logger: Arc<dyn LoggerSink>,
        executable: Arc<ExecutableSlot>,
    ) -> Result<Self, RuntimeError> {
        if let Some(path) = &config.worker_executable {
            executable.set(path)?;
        }
        if config.worker_count > 0 {
            executable.get()?;
        }

        let router = Arc::new(Router::new());
        let node = NodeServer::bind(&config.listen, Arc::clone(&router))
            .await
            .map_err(|e| RuntimeError::Node(format!("{e:#}")))?;
        let descriptor = RuntimeDescriptor::hosted_at(ClusterId::new(), node.address());
        let token = descriptor.encode()?;

        let system_logger = Arc::clone(&logger);
        let primitives = Arc::new(InMemoryPrimitives::new());
        let task_manager: Arc<dyn TaskManager> = Arc::new(InMemoryTaskManager::new());
        let services = ClusterServices {
            primitives: primitives.clone(),
            worker_manager: Arc::new(InMemoryWorkerManager::new()),
            job_queue: Arc::new(InMemoryJobQueue::start(Arc::clone(&task_manager))),
            task_manager,
            logger,
            resources: ResourceRegistry::new()
                .with::<dyn StoreProvider>(Arc::new(InMemoryStore::new()))
                .with::<dyn Serializer>(Arc::new(JsonSerializer)),
        };
        ClusterHost::bind(&router, &descriptor, &services, Arc::clone(&primitives));

        let directory = LocalDirectory::global();
        directory.register(descriptor.clone(), services);
        let state = Arc::new(RuntimeState::resolve(descriptor.clone(), directory)?);
        let manager = Arc::new(RuntimeManager::new(
            state,
            system_logger,
            ResourceRegistry::new(),
        )?);

        let transport = Arc::new(TcpTransport::new(Duration::from_secs(
            config.request_timeout_secs,
        )));
        let workers = WorkerPool::new(executable, transport, config.subscription_retries)
            .with_registry(Arc::clone(manager.worker_manager()));
        let client = SubmissionClient::new(
            Arc::clone(&manager),
            Arc::new(DependencyCompiler),
            Handle::current(),
        );

        let cluster = Self {
            node,
            token,
            manager,
            client,
            workers,
            primitives,
            default_policy: config.default_fault_policy,
        };

        if let Err(e) = cluster.start_workers(&config).await {
            cluster.shutdown().await;
            return Err(e);
        }

        tracing::info!(
            cluster = %descriptor.cluster(),
            address = %cluster.address(),
            workers = cluster.workers.len().await,
            "Cluster started"
        );
        Ok(cluster)
    }

    async fn start_workers(&self, config: &ClusterConfig) -> Result<(), RuntimeError> {
        let descriptor = self.descriptor();
        if config.worker_count > 0 {
            self.workers
                .spawn_local_workers(descriptor, i64::from(config.worker_count))
                .await?;
        }
        if !config.workers.is_empty() {
            self.workers
                .attach_remote_workers(descriptor, &config.workers)
                .await?;
        }
        Ok(())
    }

    #[must_use]
    pub fn descriptor(&self) -> &RuntimeDescriptor {
        self.manager.state().descriptor()
    }

    /// The descriptor token worker processes are started with.
    #[must_use]
    pub fn token(&self) -> String {
        self.token.clone()
    }

    #[must_use]
    pub fn address(&self) -> &NodeAddress {
        self.node.address()
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<RuntimeManager> {
        &self.manager
    }

    #[must_use]
    pub fn client(&self) -> &SubmissionClient {
        &self.client
    }

    #[must_use]
    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    #[must_use]
    pub fn primitives(&self) -> &Arc<InMemoryPrimitives> {
        &self.primitives
    }

    #[must_use]
    pub fn default_fault_policy(&self) -> FaultPolicy {
        self.default_policy
    }

    pub async fn spawn_local_workers(&self, count: i64) -> Result<Vec<WorkerRef>, RuntimeError> {
        self.workers
            .spawn_local_workers(self.descriptor(), count)
            .await
    }

    pub async fn attach_remote_workers(
        &self,
        addresses: &[NodeAddress],
    ) -> Result<Vec<WorkerRef>, RuntimeError> {
        self.workers
            .attach_remote_workers(self.descriptor(), addresses)
            .await
    }

    /// Kill workers, stop serving, and forget the cluster.
    pub async fn shutdown(self) {
        let cluster = self.descriptor().cluster();
        let removed = self.workers.kill_all().await;
        ClusterHost::unbind(self.node.router(), self.descriptor());
        LocalDirectory::global().unregister(cluster);
        self.node.shutdown();
        tracing::info!(%cluster, workers = removed, "Cluster shut down");
    }
}
