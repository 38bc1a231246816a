//! Per-driver runtime manager.

use std::sync::Arc;

use crate::assembly::AssemblyManager;
use crate::cancellation::PrimitivesFactory;
use crate::error::RuntimeError;
use crate::jobs::{JobQueue, TaskManager, WorkerManager};
use crate::logging::{JobLoggerFactory, LoggerSink};
use crate::memory::ObjectCache;
use crate::resources::ResourceRegistry;
use crate::state::RuntimeState;
use crate::store::{Serializer, StoreProvider};

/// Aggregates the runtime state with local resources.
///
/// Resources are the state's resources merged with the caller's additions,
/// additions taking precedence, plus the process-wide [`ObjectCache`] unless
/// the additions bring their own. A [`StoreProvider`] and a [`Serializer`]
/// must be present after merging.
pub struct RuntimeManager {
    state: Arc<RuntimeState>,
    resources: ResourceRegistry,
    store: Arc<dyn StoreProvider>,
    serializer: Arc<dyn Serializer>,
    assembly_manager: Arc<AssemblyManager>,
    system_logger: Arc<dyn LoggerSink>,
    job_loggers: JobLoggerFactory,
}

impl RuntimeManager {
    pub fn new(
        state: Arc<RuntimeState>,
        system_logger: Arc<dyn LoggerSink>,
        additions: ResourceRegistry,
    ) -> Result<Self, RuntimeError> {
        let mut resources = ResourceRegistry::merge(state.resources(), &additions);
        resources.register(ObjectCache::global());

        let store = resources.require::<dyn StoreProvider>()?;
        let serializer = resources.require::<dyn Serializer>()?;
        let assembly_manager = Arc::new(AssemblyManager::new(
            Arc::clone(&store),
            Arc::clone(&serializer),
        ));
        let job_loggers = JobLoggerFactory::new(Arc::clone(state.logger()));

        tracing::debug!(
            cluster = %state.descriptor().cluster(),
            store = store.id(),
            serializer = serializer.id(),
            resources = resources.len(),
            "Runtime manager ready"
        );

        Ok(Self {
            state,
            resources,
            store,
            serializer,
            assembly_manager,
            system_logger,
            job_loggers,
        })
    }

    #[must_use]
    pub fn state(&self) -> &Arc<RuntimeState> {
        &self.state
    }

    #[must_use]
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StoreProvider> {
        &self.store
    }

    #[must_use]
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    #[must_use]
    pub fn assembly_manager(&self) -> &Arc<AssemblyManager> {
        &self.assembly_manager
    }

    #[must_use]
    pub fn primitives(&self) -> &Arc<dyn PrimitivesFactory> {
        self.state.primitives()
    }

    #[must_use]
    pub fn cancellation_entry_factory(&self) -> &Arc<dyn PrimitivesFactory> {
        self.state.primitives()
    }

    #[must_use]
    pub fn worker_manager(&self) -> &Arc<dyn WorkerManager> {
        self.state.worker_manager()
    }

    #[must_use]
    pub fn job_queue(&self) -> &Arc<dyn JobQueue> {
        self.state.job_queue()
    }

    #[must_use]
    pub fn task_manager(&self) -> &Arc<dyn TaskManager> {
        self.state.task_manager()
    }

    #[must_use]
    pub fn job_logger_factory(&self) -> &JobLoggerFactory {
        &self.job_loggers
    }

    #[must_use]
    pub fn system_logger(&self) -> &Arc<dyn LoggerSink> {
        &self.system_logger
    }

    /// Resetting a running cluster is not supported.
    pub fn reset_cluster(&self) -> Result<(), RuntimeError> {
        Err(RuntimeError::NotImplemented("cluster reset"))
    }
}
