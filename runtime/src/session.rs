//! Worker side of the cluster: joining from a token, and accepting
//! subscriptions as a remote worker node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs, mem, process};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratus_messaging::{Endpoint, MessageFut, Transport, decode_body, encode_body};
use stratus_types::{ClusterId, NodeAddress, WorkerRecord};
use tokio::sync::Mutex;

use crate::error::RuntimeError;
use crate::jobs::WorkerManager;
use crate::logging::LoggerSink;
use crate::remote::{RemoteLogger, RemotePrimitives, RemoteWorkerManager};
use crate::state::RuntimeDescriptor;

pub const SUBSCRIBE_METHOD: &str = "worker.subscribe";
pub const UNSUBSCRIBE_METHOD: &str = "worker.unsubscribe";
pub const SESSIONS_METHOD: &str = "worker.sessions";

const JOIN_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub token: String,
    /// Retries the worker may spend reaching the driver's services.
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnsubscribeRequest {
    cluster: ClusterId,
}

fn hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// A worker's membership in one cluster.
pub struct WorkerSession {
    descriptor: RuntimeDescriptor,
    record: WorkerRecord,
    logger: Arc<RemoteLogger>,
    registry: RemoteWorkerManager,
    primitives: RemotePrimitives,
}

impl WorkerSession {
    /// Decode `token`, register with the cluster's worker registry and
    /// announce the join on the cluster logger.
    ///
    /// A worker serving its own endpoints passes its `address`, which becomes
    /// its identity. Otherwise the identity is `pid:<pid>`.
    pub async fn join(
        token: &str,
        transport: Arc<dyn Transport>,
        address: Option<NodeAddress>,
    ) -> Result<Self, RuntimeError> {
        let descriptor = RuntimeDescriptor::decode(token)?;
        let pid = process::id();
        let record = WorkerRecord {
            identity: address
                .as_ref()
                .map_or_else(|| format!("pid:{pid}"), ToString::to_string),
            hostname: hostname(),
            pid,
            address,
        };

        let registry =
            RemoteWorkerManager::new(Arc::clone(&transport), descriptor.worker_manager().clone());
        registry.register(record.clone()).await?;

        let logger = Arc::new(RemoteLogger::start(
            Arc::clone(&transport),
            descriptor.logger().clone(),
        ));
        logger.log_line(&format!(
            "worker {} on {} joined cluster {}",
            record.identity,
            record.hostname,
            descriptor.cluster()
        ));
        tracing::info!(
            cluster = %descriptor.cluster(),
            identity = %record.identity,
            "Joined cluster"
        );

        let primitives = RemotePrimitives::new(transport, descriptor.primitives().clone());
        Ok(Self {
            descriptor,
            record,
            logger,
            registry,
            primitives,
        })
    }

    #[must_use]
    pub fn descriptor(&self) -> &RuntimeDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.record.identity
    }

    #[must_use]
    pub fn logger(&self) -> Arc<dyn LoggerSink> {
        Arc::clone(&self.logger) as Arc<dyn LoggerSink>
    }

    #[must_use]
    pub fn primitives(&self) -> &RemotePrimitives {
        &self.primitives
    }

    /// Confirm the cluster is still reachable and still lists this worker.
    pub async fn heartbeat(&self) -> Result<bool, RuntimeError> {
        let workers = self.registry.workers().await?;
        Ok(workers.iter().any(|w| w.identity == self.record.identity))
    }

    /// Unregister and flush pending log lines.
    pub async fn leave(self) -> Result<(), RuntimeError> {
        self.logger
            .log_line(&format!("worker {} leaving", self.record.identity));
        let result = self.registry.unregister(&self.record.identity).await;
        if let Ok(logger) = Arc::try_unwrap(self.logger) {
            logger.close().await;
        }
        tracing::info!(cluster = %self.descriptor.cluster(), "Left cluster");
        result.map(|_| ())
    }
}

/// Join with retries on connectivity errors.
pub async fn join_with_retries(
    token: &str,
    transport: Arc<dyn Transport>,
    address: Option<NodeAddress>,
    retries: u32,
) -> Result<WorkerSession, RuntimeError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match WorkerSession::join(token, Arc::clone(&transport), address.clone()).await {
            Err(RuntimeError::Transport(e)) if e.is_retryable() && attempt <= retries => {
                tracing::debug!(attempt, error = %e, "Join failed; retrying");
                tokio::time::sleep(JOIN_BACKOFF * attempt).await;
            }
            other => return other,
        }
    }
}

/// Endpoint through which a driver subscribes this node as a worker.
///
/// Subscribing joins the cluster named by the token. A node holds at most one
/// session per cluster; repeated subscriptions are acknowledged without
/// joining again.
pub struct SubscriptionEndpoint {
    transport: Arc<dyn Transport>,
    address: NodeAddress,
    sessions: Mutex<HashMap<ClusterId, WorkerSession>>,
}

impl SubscriptionEndpoint {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, address: NodeAddress) -> Self {
        Self {
            transport,
            address,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Leave every cluster this node joined.
    pub async fn leave_all(&self) {
        let sessions = mem::take(&mut *self.sessions.lock().await);
        for (cluster, session) in sessions {
            if let Err(e) = session.leave().await {
                tracing::warn!(%cluster, error = %e, "Failed to leave cluster");
            }
        }
    }

    async fn subscribe(&self, request: SubscribeRequest) -> Result<SubscribeResponse, RuntimeError> {
        let descriptor = RuntimeDescriptor::decode(&request.token)?;
        let mut sessions = self.sessions.lock().await;
        if !sessions.contains_key(&descriptor.cluster()) {
            let session = join_with_retries(
                &request.token,
                Arc::clone(&self.transport),
                Some(self.address.clone()),
                request.retries,
            )
            .await?;
            sessions.insert(descriptor.cluster(), session);
        }
        Ok(SubscribeResponse {
            identity: self.address.to_string(),
        })
    }

    async fn unsubscribe(&self, cluster: ClusterId) -> Result<bool, RuntimeError> {
        let session = self.sessions.lock().await.remove(&cluster);
        match session {
            Some(session) => session.leave().await.map(|()| true),
            None => Ok(false),
        }
    }
}

impl Endpoint for SubscriptionEndpoint {
    fn handle<'a>(&'a self, method: &'a str, body: Value) -> MessageFut<'a, Result<Value, String>> {
        Box::pin(async move {
            match method {
                SUBSCRIBE_METHOD => {
                    let request: SubscribeRequest = decode_body(method, body)?;
                    let response = self.subscribe(request).await.map_err(|e| e.to_string())?;
                    encode_body(&response)
                }
                UNSUBSCRIBE_METHOD => {
                    let UnsubscribeRequest { cluster } = decode_body(method, body)?;
                    let left = self.unsubscribe(cluster).await.map_err(|e| e.to_string())?;
                    Ok(Value::Bool(left))
                }
                SESSIONS_METHOD => {
                    let clusters: Vec<ClusterId> =
                        self.sessions.lock().await.keys().copied().collect();
                    encode_body(&clusters)
                }
                other => Err(format!("unknown method {other}")),
            }
        })
    }
}
