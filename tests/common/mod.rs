//! Shared test utilities and fixtures
//!
//! Common infrastructure for integration tests.

#![allow(dead_code)]

use std::fs;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use stratus_messaging::{NodeServer, Router, TcpTransport};
use stratus_runtime::{
    Cluster, ClusterConfig, ExecutableSlot, FnLogger, LoggerSink, SubscriptionEndpoint, endpoints,
};
use stratus_types::FaultPolicy;
use tempfile::TempDir;

/// A worker executable that stays alive without joining anything.
///
/// The directory must outlive every worker spawned from it.
pub struct SleepingWorker {
    pub dir: TempDir,
    pub slot: Arc<ExecutableSlot>,
}

#[cfg(unix)]
pub fn sleeping_worker() -> SleepingWorker {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stratus-worker");
    fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    let slot = Arc::new(ExecutableSlot::new());
    slot.set(&path).unwrap();
    SleepingWorker { dir, slot }
}

/// Cluster log lines, collected in order.
#[derive(Clone, Default)]
pub struct LogLines(Arc<Mutex<Vec<String>>>);

impl LogLines {
    pub fn sink(&self) -> Arc<dyn LoggerSink> {
        let lines = Arc::clone(&self.0);
        Arc::new(FnLogger::new(move |line: &str| {
            lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(line.to_string());
        }))
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.snapshot().iter().any(|line| line.contains(needle))
    }
}

/// Loopback config with fast retries and no local workers.
pub fn config() -> ClusterConfig {
    ClusterConfig {
        subscription_retries: 1,
        request_timeout_secs: 5,
        default_fault_policy: FaultPolicy::NoRetry,
        ..ClusterConfig::default()
    }
}

/// Cluster without local workers, logging into `logs`.
pub async fn start_cluster(logs: &LogLines) -> Cluster {
    Cluster::init_local_with(config(), logs.sink(), Arc::new(ExecutableSlot::new()))
        .await
        .unwrap()
}

/// A worker node serving the subscription endpoint over TCP.
pub struct WorkerNode {
    pub node: NodeServer,
    pub subscriptions: Arc<SubscriptionEndpoint>,
}

pub async fn start_worker_node() -> WorkerNode {
    let router = Arc::new(Router::new());
    let node = NodeServer::bind("127.0.0.1:0", Arc::clone(&router))
        .await
        .unwrap();
    let subscriptions = Arc::new(SubscriptionEndpoint::new(
        Arc::new(TcpTransport::default()),
        node.address().clone(),
    ));
    router.bind(endpoints::WORKER_MANAGER, subscriptions.clone());
    WorkerNode {
        node,
        subscriptions,
    }
}

/// Poll `check` until it holds or about a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
