//! Client-side orchestration for Stratus clusters.
//!
//! A driver process hosts a cluster ([`Cluster::init_local`]), manages its
//! workers ([`WorkerPool`]) and submits workflows through a
//! [`SubmissionClient`]. The cluster's location travels between processes as a
//! [`RuntimeDescriptor`] token; worker processes turn it back into a
//! [`WorkerSession`].

use std::future::Future;
use std::pin::Pin;

mod assembly;
mod cancellation;
mod client;
mod cluster;
mod config;
mod error;
mod host;
mod jobs;
mod logging;
mod manager;
mod memory;
mod remote;
mod resources;
mod session;
mod state;
mod store;
mod workers;
mod workflow;

/// Boxed future returned by runtime service traits.
pub type RuntimeFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use assembly::{AssemblyId, AssemblyManager, Dependency};
pub use cancellation::{
    CancellationBridge, CancellationEntry, CancellationScope, PrimitivesFactory, ScopeGuard,
};
pub use client::SubmissionClient;
pub use cluster::Cluster;
pub use config::{ClusterConfig, ConfigError, ExecutableSlot};
pub use error::RuntimeError;
pub use host::{
    ClusterHost, JobQueueEndpoint, LoggerEndpoint, PrimitivesEndpoint, TaskEndpoint,
    WorkerRegistryEndpoint,
};
pub use jobs::{
    ErasedValue, Job, JobBody, JobOutcome, JobQueue, ResultCell, ResultSink, Submission,
    TaskManager, TaskStatus, WorkerManager, result_cell,
};
pub use logging::{FnLogger, JobLogger, JobLoggerFactory, LoggerSink, NullLogger, TracingLogger};
pub use manager::RuntimeManager;
pub use memory::{
    DEFAULT_RETENTION, InMemoryJobQueue, InMemoryPrimitives, InMemoryStore, InMemoryTaskManager,
    InMemoryWorkerManager, ObjectCache, in_memory_services,
};
pub use remote::{RemoteLogger, RemotePrimitives, RemoteWorkerManager};
pub use resources::ResourceRegistry;
pub use session::{
    SESSIONS_METHOD, SUBSCRIBE_METHOD, SubscribeRequest, SubscribeResponse, SubscriptionEndpoint,
    UNSUBSCRIBE_METHOD, WorkerSession, join_with_retries,
};
pub use state::{
    ClusterServices, LocalDirectory, Resolver, RuntimeDescriptor, RuntimeState, endpoints,
};
pub use store::{JsonSerializer, Serializer, StoreProvider};
pub use workers::{DEFAULT_SUBSCRIPTION_RETRIES, WorkerPool};
pub use workflow::{
    Cloud, CompiledWorkflow, DependencyCompiler, ExecutionContext, WorkflowCompiler, compile,
};
