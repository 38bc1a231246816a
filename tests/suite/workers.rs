//! Worker set bookkeeping on a live cluster.

use stratus_runtime::RuntimeError;
use stratus_types::WorkerRef;

use crate::common::{LogLines, start_cluster, start_worker_node};

#[tokio::test]
async fn non_positive_counts_leave_the_set_unchanged() {
    let cluster = start_cluster(&LogLines::default()).await;
    for count in [0, -3] {
        let err = cluster.spawn_local_workers(count).await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }
    assert!(cluster.workers().is_empty().await);
    cluster.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn spawn_grows_the_set_and_kill_all_is_idempotent() {
    use std::sync::Arc;

    use stratus_runtime::{Cluster, ClusterConfig};

    let worker = crate::common::sleeping_worker();
    let cluster = Cluster::init_local_with(
        ClusterConfig {
            worker_count: 1,
            ..crate::common::config()
        },
        LogLines::default().sink(),
        Arc::clone(&worker.slot),
    )
    .await
    .unwrap();

    let added = cluster.spawn_local_workers(2).await.unwrap();
    assert_eq!(added.len(), 2);

    let workers = cluster.workers().current_workers().await;
    assert_eq!(workers.len(), 3);
    assert_eq!(&workers[1..], added.as_slice());
    let mut pids: Vec<u32> = workers
        .iter()
        .filter_map(|w| match w {
            WorkerRef::Local(pid) => Some(*pid),
            WorkerRef::Remote(_) => None,
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    assert_eq!(pids.len(), 3);

    assert_eq!(cluster.workers().kill_all().await, 3);
    assert_eq!(cluster.workers().kill_all().await, 0);
    assert!(cluster.workers().is_empty().await);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_workers_are_forgotten_by_kill_all() {
    let cluster = start_cluster(&LogLines::default()).await;
    let first = start_worker_node().await;
    let second = start_worker_node().await;

    let attached = cluster
        .attach_remote_workers(&[first.node.address().clone(), second.node.address().clone()])
        .await
        .unwrap();
    assert_eq!(attached.len(), 2);
    assert!(attached.iter().all(|w| !w.is_local()));
    assert_eq!(cluster.workers().current_workers().await, attached);

    assert_eq!(cluster.workers().kill_all().await, 2);
    assert!(cluster.workers().current_workers().await.is_empty());

    // Forgetting a remote worker does not end its session.
    assert_eq!(first.subscriptions.session_count().await, 1);

    first.subscriptions.leave_all().await;
    second.subscriptions.leave_all().await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn attach_keeps_workers_subscribed_before_a_failure() {
    let cluster = start_cluster(&LogLines::default()).await;
    let node = start_worker_node().await;
    let dead = stratus_types::NodeAddress::parse("127.0.0.1:1").unwrap();

    let err = cluster
        .attach_remote_workers(&[node.node.address().clone(), dead])
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::WorkerUnreachable { .. }));

    let workers = cluster.workers().current_workers().await;
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].identity(), node.node.address().to_string());

    node.subscriptions.leave_all().await;
    cluster.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_never_see_a_partial_operation() {
    use std::sync::Arc;

    use stratus_runtime::{Cluster, ClusterConfig};
    use tokio_util::sync::CancellationToken;

    let worker = crate::common::sleeping_worker();
    let cluster = Arc::new(
        Cluster::init_local_with(
            crate::common::config(),
            LogLines::default().sink(),
            Arc::clone(&worker.slot),
        )
        .await
        .unwrap(),
    );
    let nodes = [start_worker_node().await, start_worker_node().await];
    let addresses: Vec<_> = nodes.iter().map(|n| n.node.address().clone()).collect();

    // Every mutation adds workers in pairs, so a whole-operation snapshot
    // holds an even number of locals and either zero or both remotes.
    let stop = CancellationToken::new();
    let reader = {
        let cluster = Arc::clone(&cluster);
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut snapshots = 0_usize;
            while !stop.is_cancelled() {
                let workers = cluster.workers().current_workers().await;
                let locals = workers.iter().filter(|w| w.is_local()).count();
                let remotes = workers.len() - locals;
                assert_eq!(locals % 2, 0, "torn spawn in {workers:?}");
                assert!(remotes == 0 || remotes == 2, "torn attach in {workers:?}");
                snapshots += 1;
                tokio::task::yield_now().await;
            }
            snapshots
        })
    };

    let mut spawns = Vec::new();
    for _ in 0..3 {
        let cluster = Arc::clone(&cluster);
        spawns.push(tokio::spawn(async move {
            cluster.spawn_local_workers(2).await.unwrap().len()
        }));
    }
    let attach = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move { cluster.attach_remote_workers(&addresses).await.unwrap().len() })
    };
    let kill = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move { cluster.workers().kill_all().await })
    };

    let mut added = attach.await.unwrap();
    for spawn in spawns {
        added += spawn.await.unwrap();
    }
    let removed = kill.await.unwrap();

    stop.cancel();
    assert!(reader.await.unwrap() > 0);
    assert_eq!(added, 8);
    assert_eq!(cluster.workers().len().await, added - removed);

    for node in &nodes {
        node.subscriptions.leave_all().await;
    }
    let Ok(cluster) = Arc::try_unwrap(cluster) else {
        panic!("cluster still shared after every task finished");
    };
    cluster.shutdown().await;
}
