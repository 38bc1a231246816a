//! Proxies for cluster services reached over a [`Transport`].

use std::sync::Arc;
use std::time::Duration;

use stratus_messaging::{Transport, call};
use stratus_types::{CancellationId, Locator, WorkerRecord};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::RuntimeFut;
use crate::cancellation::{CancellationEntry, CancellationScope, PrimitivesFactory};
use crate::error::RuntimeError;
use crate::host::{EntryBody, IdentityBody, methods};
use crate::jobs::WorkerManager;
use crate::logging::LoggerSink;

const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Posts log lines to a remote logger endpoint, in order.
///
/// Lines are queued and forwarded by a background task, so `log_line` never
/// blocks. [`close`](Self::close) flushes the queue.
pub struct RemoteLogger {
    tx: mpsc::UnboundedSender<String>,
    forwarder: JoinHandle<()>,
}

impl RemoteLogger {
    /// Start forwarding. Must be called within a Tokio runtime.
    #[must_use]
    pub fn start(transport: Arc<dyn Transport>, locator: Locator) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let forwarder = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let body = serde_json::json!({ "line": line });
                if let Err(e) = transport.post(&locator, methods::LOG_LINE, body).await {
                    tracing::debug!(%locator, error = %e, "Dropping remote log line");
                }
            }
        });
        Self { tx, forwarder }
    }

    /// Stop accepting lines and wait until queued lines have been sent.
    pub async fn close(self) {
        let Self { tx, forwarder } = self;
        drop(tx);
        if let Err(e) = forwarder.await {
            tracing::debug!(error = %e, "Remote log forwarder ended abnormally");
        }
    }
}

impl LoggerSink for RemoteLogger {
    fn log_line(&self, line: &str) {
        if self.tx.send(line.to_string()).is_err() {
            tracing::debug!("Remote logger closed; line dropped");
        }
    }
}

/// Worker registry hosted on another node.
pub struct RemoteWorkerManager {
    transport: Arc<dyn Transport>,
    locator: Locator,
}

impl RemoteWorkerManager {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, locator: Locator) -> Self {
        Self { transport, locator }
    }
}

impl WorkerManager for RemoteWorkerManager {
    fn register(&self, worker: WorkerRecord) -> RuntimeFut<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            call::<_, serde_json::Value>(
                self.transport.as_ref(),
                &self.locator,
                methods::WORKERS_REGISTER,
                &worker,
            )
            .await?;
            Ok(())
        })
    }

    fn unregister<'a>(&'a self, identity: &'a str) -> RuntimeFut<'a, Result<bool, RuntimeError>> {
        Box::pin(async move {
            let body = IdentityBody {
                identity: identity.to_string(),
            };
            Ok(call(
                self.transport.as_ref(),
                &self.locator,
                methods::WORKERS_UNREGISTER,
                &body,
            )
            .await?)
        })
    }

    fn workers(&self) -> RuntimeFut<'_, Result<Vec<WorkerRecord>, RuntimeError>> {
        Box::pin(async move {
            Ok(call(
                self.transport.as_ref(),
                &self.locator,
                methods::WORKERS_LIST,
                &(),
            )
            .await?)
        })
    }
}

/// Cancellation entries hosted on another node.
pub struct RemotePrimitives {
    transport: Arc<dyn Transport>,
    locator: Locator,
}

impl RemotePrimitives {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, locator: Locator) -> Self {
        Self { transport, locator }
    }

    /// Handle to an existing entry.
    #[must_use]
    pub fn entry(&self, id: CancellationId) -> CancellationScope {
        CancellationScope::new(Arc::new(RemoteCancellationEntry {
            id,
            transport: Arc::clone(&self.transport),
            locator: self.locator.clone(),
        }))
    }
}

impl PrimitivesFactory for RemotePrimitives {
    fn create_cancellation_entry(&self) -> RuntimeFut<'_, Result<CancellationScope, RuntimeError>> {
        Box::pin(async move {
            let EntryBody { id } = call(
                self.transport.as_ref(),
                &self.locator,
                methods::CANCELLATION_CREATE,
                &(),
            )
            .await?;
            Ok(self.entry(id))
        })
    }
}

struct RemoteCancellationEntry {
    id: CancellationId,
    transport: Arc<dyn Transport>,
    locator: Locator,
}

impl CancellationEntry for RemoteCancellationEntry {
    fn id(&self) -> CancellationId {
        self.id
    }

    fn cancel(&self) -> RuntimeFut<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            call::<_, serde_json::Value>(
                self.transport.as_ref(),
                &self.locator,
                methods::CANCELLATION_CANCEL,
                &EntryBody { id: self.id },
            )
            .await?;
            Ok(())
        })
    }

    fn is_cancellation_requested(&self) -> RuntimeFut<'_, Result<bool, RuntimeError>> {
        Box::pin(async move {
            Ok(call(
                self.transport.as_ref(),
                &self.locator,
                methods::CANCELLATION_STATUS,
                &EntryBody { id: self.id },
            )
            .await?)
        })
    }

    fn cancelled(&self) -> RuntimeFut<'_, ()> {
        Box::pin(async move {
            loop {
                match self.is_cancellation_requested().await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::debug!(entry = %self.id, error = %e, "Cancellation status poll failed");
                    }
                }
                tokio::time::sleep(CANCELLATION_POLL_INTERVAL).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use stratus_messaging::{LocalTransport, Router};
    use stratus_types::{ClusterId, NodeAddress};

    use super::*;
    use crate::host::ClusterHost;
    use crate::logging::tests::CapturingLogger;
    use crate::memory::{InMemoryPrimitives, in_memory_services};
    use crate::resources::ResourceRegistry;
    use crate::state::RuntimeDescriptor;

    struct Hosted {
        transport: Arc<dyn Transport>,
        descriptor: RuntimeDescriptor,
        primitives: Arc<InMemoryPrimitives>,
        logs: Arc<CapturingLogger>,
    }

    fn hosted() -> Hosted {
        let address = NodeAddress::parse("driver:7000").unwrap();
        let descriptor = RuntimeDescriptor::hosted_at(ClusterId::new(), &address);
        let primitives = Arc::new(InMemoryPrimitives::new());
        let logs = Arc::new(CapturingLogger::default());
        let mut services = in_memory_services(ResourceRegistry::new());
        services.primitives = primitives.clone();
        services.logger = logs.clone();

        let router = Arc::new(Router::new());
        ClusterHost::bind(&router, &descriptor, &services, primitives.clone());
        let transport = LocalTransport::new();
        transport.add_node(address, router);
        Hosted {
            transport: Arc::new(transport),
            descriptor,
            primitives,
            logs,
        }
    }

    #[tokio::test]
    async fn remote_logger_flushes_on_close() {
        let h = hosted();
        let logger = RemoteLogger::start(h.transport.clone(), h.descriptor.logger().clone());
        logger.log_line("first");
        logger.log_line("second");
        logger.close().await;
        assert_eq!(h.logs.lines(), ["first", "second"]);
    }

    #[tokio::test]
    async fn remote_registry_round_trip() {
        let h = hosted();
        let registry = RemoteWorkerManager::new(h.transport.clone(), h.descriptor.worker_manager().clone());
        registry
            .register(WorkerRecord {
                identity: "pid:77".to_string(),
                hostname: "w1".to_string(),
                pid: 77,
                address: None,
            })
            .await
            .unwrap();
        assert_eq!(registry.workers().await.unwrap().len(), 1);
        assert!(registry.unregister("pid:77").await.unwrap());
        assert!(registry.workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_cancellation_reaches_host_entry() {
        let h = hosted();
        let remote = RemotePrimitives::new(h.transport.clone(), h.descriptor.primitives().clone());
        let scope = remote.create_cancellation_entry().await.unwrap();
        assert!(!scope.is_cancellation_requested().await.unwrap());

        let local = h.primitives.lookup(scope.id()).unwrap();
        local.cancel().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), scope.cancelled())
            .await
            .unwrap();

        scope.cancel().await.unwrap();
        assert_eq!(h.primitives.cancelled_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_registry_is_a_transport_error() {
        let h = hosted();
        let elsewhere = Locator::new(NodeAddress::parse("other:1").unwrap(), "stratus.workers");
        let registry = RemoteWorkerManager::new(h.transport, elsewhere);
        assert!(matches!(
            registry.workers().await,
            Err(RuntimeError::Transport(_))
        ));
    }
}
