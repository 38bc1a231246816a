//! Cluster bootstrap, worker sessions and shutdown over real TCP nodes.

use std::sync::Arc;

use stratus_messaging::TcpTransport;
use stratus_runtime::{Cloud, Cluster, ClusterConfig, ExecutableSlot, RuntimeError, WorkerSession};
use stratus_types::{FaultPolicy, NodeAddress, WorkerRef};

use crate::common::{LogLines, config, eventually, start_cluster, start_worker_node};

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn init_local_with_three_workers_runs_a_workflow() {
    let worker = crate::common::sleeping_worker();
    let logs = LogLines::default();
    let cluster = Cluster::init_local_with(
        ClusterConfig {
            worker_count: 3,
            ..config()
        },
        logs.sink(),
        Arc::clone(&worker.slot),
    )
    .await
    .unwrap();

    let workers = cluster.workers().current_workers().await;
    assert_eq!(workers.len(), 3);
    assert!(workers.iter().all(WorkerRef::is_local));

    let answer = cluster
        .client()
        .submit(Cloud::value("answer", 42), None, FaultPolicy::NoRetry)
        .await
        .unwrap();
    assert_eq!(answer, 42);

    // The submission's scope was created once and cancelled before returning.
    assert_eq!(cluster.primitives().created_count(), 1);
    assert_eq!(cluster.primitives().cancelled_count(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn missing_executable_fails_startup() {
    let err = Cluster::init_local_with(
        ClusterConfig {
            worker_count: 1,
            ..config()
        },
        LogLines::default().sink(),
        Arc::new(ExecutableSlot::new()),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, RuntimeError::InvalidState(_)));
}

#[tokio::test]
async fn unreachable_configured_worker_fails_startup() {
    let err = Cluster::init_local_with(
        ClusterConfig {
            workers: vec![NodeAddress::parse("127.0.0.1:1").unwrap()],
            subscription_retries: 0,
            ..config()
        },
        LogLines::default().sink(),
        Arc::new(ExecutableSlot::new()),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(
        err,
        RuntimeError::WorkerUnreachable { attempts: 1, .. }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_session_joins_and_leaves() {
    let logs = LogLines::default();
    let cluster = start_cluster(&logs).await;
    let registry = Arc::clone(cluster.manager().worker_manager());

    let session = WorkerSession::join(&cluster.token(), Arc::new(TcpTransport::default()), None)
        .await
        .unwrap();
    let identity = session.identity().to_string();
    assert!(identity.starts_with("pid:"));
    assert_eq!(session.descriptor(), cluster.descriptor());
    assert!(session.heartbeat().await.unwrap());

    let listed = registry.workers().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].identity, identity);
    assert!(eventually(|| logs.contains("joined cluster")).await);

    session.leave().await.unwrap();
    assert!(registry.workers().await.unwrap().is_empty());
    assert!(eventually(|| logs.contains("leaving")).await);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_node_attaches_through_subscription() {
    let logs = LogLines::default();
    let cluster = start_cluster(&logs).await;
    let worker_node = start_worker_node().await;
    let address = worker_node.node.address().clone();

    let attached = cluster
        .attach_remote_workers(&[address.clone()])
        .await
        .unwrap();
    assert_eq!(attached.len(), 1);
    assert_eq!(attached[0].identity(), address.to_string());
    assert_eq!(worker_node.subscriptions.session_count().await, 1);

    let listed = cluster.manager().worker_manager().workers().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].address.as_ref(), Some(&address));

    worker_node.subscriptions.leave_all().await;
    assert!(
        cluster
            .manager()
            .worker_manager()
            .workers()
            .await
            .unwrap()
            .is_empty()
    );

    cluster.shutdown().await;
    worker_node.node.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn session_against_stopped_cluster_fails() {
    let cluster = start_cluster(&LogLines::default()).await;
    let token = cluster.token();
    cluster.shutdown().await;

    let err = WorkerSession::join(&token, Arc::new(TcpTransport::default()), None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RuntimeError::Transport(_)));
}

#[tokio::test]
async fn reset_is_not_implemented() {
    let cluster = start_cluster(&LogLines::default()).await;
    assert!(matches!(
        cluster.manager().reset_cluster(),
        Err(RuntimeError::NotImplemented(_))
    ));
    cluster.shutdown().await;
}
