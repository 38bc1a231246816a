//! Endpoints that expose a hosted cluster's services to other nodes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratus_messaging::{Endpoint, MessageFut, Router, decode_body, encode_body};
use stratus_types::{CancellationId, TaskId, WorkerRecord};

use crate::jobs::{JobQueue, TaskManager, WorkerManager};
use crate::logging::LoggerSink;
use crate::memory::InMemoryPrimitives;
use crate::state::{ClusterServices, RuntimeDescriptor};

pub(crate) mod methods {
    pub const LOG_LINE: &str = "log.line";
    pub const WORKERS_REGISTER: &str = "workers.register";
    pub const WORKERS_UNREGISTER: &str = "workers.unregister";
    pub const WORKERS_LIST: &str = "workers.list";
    pub const CANCELLATION_CREATE: &str = "cancellation.create";
    pub const CANCELLATION_CANCEL: &str = "cancellation.cancel";
    pub const CANCELLATION_STATUS: &str = "cancellation.status";
    pub const TASKS_STATUS: &str = "tasks.status";
    pub const JOBS_PENDING: &str = "jobs.pending";
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LogLine {
    pub line: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IdentityBody {
    pub identity: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EntryBody {
    pub id: CancellationId,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TaskBody {
    pub task: TaskId,
}

fn unknown(method: &str) -> String {
    format!("unknown method {method}")
}

pub struct LoggerEndpoint {
    sink: Arc<dyn LoggerSink>,
}

impl Endpoint for LoggerEndpoint {
    fn handle<'a>(&'a self, method: &'a str, body: Value) -> MessageFut<'a, Result<Value, String>> {
        Box::pin(async move {
            match method {
                methods::LOG_LINE => {
                    let LogLine { line } = decode_body(method, body)?;
                    self.sink.log_line(&line);
                    Ok(Value::Null)
                }
                other => Err(unknown(other)),
            }
        })
    }
}

pub struct WorkerRegistryEndpoint {
    registry: Arc<dyn WorkerManager>,
}

impl Endpoint for WorkerRegistryEndpoint {
    fn handle<'a>(&'a self, method: &'a str, body: Value) -> MessageFut<'a, Result<Value, String>> {
        Box::pin(async move {
            match method {
                methods::WORKERS_REGISTER => {
                    let record: WorkerRecord = decode_body(method, body)?;
                    self.registry.register(record).await.map_err(|e| e.to_string())?;
                    Ok(Value::Null)
                }
                methods::WORKERS_UNREGISTER => {
                    let IdentityBody { identity } = decode_body(method, body)?;
                    let removed = self
                        .registry
                        .unregister(&identity)
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(Value::Bool(removed))
                }
                methods::WORKERS_LIST => {
                    let workers = self.registry.workers().await.map_err(|e| e.to_string())?;
                    encode_body(&workers)
                }
                other => Err(unknown(other)),
            }
        })
    }
}

pub struct PrimitivesEndpoint {
    primitives: Arc<InMemoryPrimitives>,
}

impl Endpoint for PrimitivesEndpoint {
    fn handle<'a>(&'a self, method: &'a str, body: Value) -> MessageFut<'a, Result<Value, String>> {
        Box::pin(async move {
            match method {
                methods::CANCELLATION_CREATE => encode_body(&EntryBody {
                    id: self.primitives.create().id(),
                }),
                methods::CANCELLATION_CANCEL | methods::CANCELLATION_STATUS => {
                    let EntryBody { id } = decode_body(method, body)?;
                    let scope = self
                        .primitives
                        .lookup(id)
                        .ok_or_else(|| format!("no cancellation entry {id}"))?;
                    if method == methods::CANCELLATION_CANCEL {
                        scope.cancel().await.map_err(|e| e.to_string())?;
                        Ok(Value::Null)
                    } else {
                        let requested = scope
                            .is_cancellation_requested()
                            .await
                            .map_err(|e| e.to_string())?;
                        Ok(Value::Bool(requested))
                    }
                }
                other => Err(unknown(other)),
            }
        })
    }
}

/// Read-only view of task status.
pub struct TaskEndpoint {
    tasks: Arc<dyn TaskManager>,
}

impl Endpoint for TaskEndpoint {
    fn handle<'a>(&'a self, method: &'a str, body: Value) -> MessageFut<'a, Result<Value, String>> {
        Box::pin(async move {
            match method {
                methods::TASKS_STATUS => {
                    let TaskBody { task } = decode_body(method, body)?;
                    encode_body(&self.tasks.status(task))
                }
                other => Err(unknown(other)),
            }
        })
    }
}

pub struct JobQueueEndpoint {
    queue: Arc<dyn JobQueue>,
}

impl Endpoint for JobQueueEndpoint {
    fn handle<'a>(&'a self, method: &'a str, _body: Value) -> MessageFut<'a, Result<Value, String>> {
        Box::pin(async move {
            match method {
                methods::JOBS_PENDING => encode_body(&self.queue.pending()),
                other => Err(unknown(other)),
            }
        })
    }
}

/// Binds a cluster's service endpoints on the node serving its descriptor.
pub struct ClusterHost;

impl ClusterHost {
    /// Bind every service under the endpoint name its locator in
    /// `descriptor` carries. Cancellation entries are served from
    /// `primitives`, which must be the factory in `services`.
    pub fn bind(
        router: &Router,
        descriptor: &RuntimeDescriptor,
        services: &ClusterServices,
        primitives: Arc<InMemoryPrimitives>,
    ) {
        router.bind(
            descriptor.logger().endpoint(),
            Arc::new(LoggerEndpoint {
                sink: Arc::clone(&services.logger),
            }),
        );
        router.bind(
            descriptor.worker_manager().endpoint(),
            Arc::new(WorkerRegistryEndpoint {
                registry: Arc::clone(&services.worker_manager),
            }),
        );
        router.bind(
            descriptor.primitives().endpoint(),
            Arc::new(PrimitivesEndpoint { primitives }),
        );
        router.bind(
            descriptor.task_manager().endpoint(),
            Arc::new(TaskEndpoint {
                tasks: Arc::clone(&services.task_manager),
            }),
        );
        router.bind(
            descriptor.job_queue().endpoint(),
            Arc::new(JobQueueEndpoint {
                queue: Arc::clone(&services.job_queue),
            }),
        );
        tracing::debug!(cluster = %descriptor.cluster(), "Cluster endpoints bound");
    }

    pub fn unbind(router: &Router, descriptor: &RuntimeDescriptor) {
        for locator in [
            descriptor.logger(),
            descriptor.worker_manager(),
            descriptor.primitives(),
            descriptor.task_manager(),
            descriptor.job_queue(),
        ] {
            router.unbind(locator.endpoint());
        }
    }
}
