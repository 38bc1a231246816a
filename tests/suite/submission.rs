//! Submitting workflows to a live cluster.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use stratus_runtime::{Cloud, Dependency, ExecutionContext, RuntimeError, StoreProvider};
use stratus_types::FaultPolicy;
use tokio_util::sync::CancellationToken;

use crate::common::{LogLines, eventually, start_cluster};

#[derive(Debug, thiserror::Error)]
#[error("bad input: {0}")]
struct BadInput(String);

async fn reject(_ctx: ExecutionContext) -> anyhow::Result<i32> {
    Err(BadInput("negative radius".to_string()).into())
}

async fn explode(_ctx: ExecutionContext) -> anyhow::Result<i32> {
    panic!("workflow exploded")
}

async fn linger(_ctx: ExecutionContext) -> anyhow::Result<i32> {
    tokio::time::sleep(Duration::from_secs(60)).await;
    Ok(0)
}

fn runtime_error(err: &anyhow::Error) -> &RuntimeError {
    err.downcast_ref::<RuntimeError>()
        .unwrap_or_else(|| panic!("expected a runtime error, got {err:#}"))
}

#[tokio::test(flavor = "multi_thread")]
async fn domain_error_is_returned_unwrapped() {
    let cluster = start_cluster(&LogLines::default()).await;

    let err = cluster
        .client()
        .submit(Cloud::new("reject", reject), None, FaultPolicy::NoRetry)
        .await
        .unwrap_err();
    let bad = err.downcast_ref::<BadInput>().unwrap();
    assert_eq!(bad.0, "negative radius");
    assert!(err.downcast_ref::<RuntimeError>().is_none());

    // A workflow error is an outcome, not a fault: the scope is still released once.
    assert_eq!(cluster.primitives().cancelled_count(), 1);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn external_cancellation_cancels_the_scope_once() {
    let cluster = start_cluster(&LogLines::default()).await;
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        cluster
            .client()
            .submit(Cloud::new("linger", linger), Some(token), FaultPolicy::NoRetry),
    )
    .await
    .expect("cancellation must end the submission")
    .unwrap_err();
    assert!(matches!(runtime_error(&err), RuntimeError::Cancelled));

    assert_eq!(cluster.primitives().created_count(), 1);
    assert_eq!(cluster.primitives().cancelled_count(), 1);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn already_cancelled_token_never_yields_a_value() {
    let cluster = start_cluster(&LogLines::default()).await;
    let token = CancellationToken::new();
    token.cancel();

    let err = cluster
        .client()
        .submit(Cloud::new("linger", linger), Some(token), FaultPolicy::NoRetry)
        .await
        .unwrap_err();
    assert!(matches!(runtime_error(&err), RuntimeError::Cancelled));
    assert_eq!(cluster.primitives().cancelled_count(), 1);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn faults_are_retried_until_the_policy_gives_up() {
    let cluster = start_cluster(&LogLines::default()).await;
    let policy = FaultPolicy::Retry {
        max_retries: 2,
        delay_ms: 1,
    };

    let err = cluster
        .client()
        .submit(Cloud::new("explode", explode), None, policy)
        .await
        .unwrap_err();
    assert!(matches!(
        runtime_error(&err),
        RuntimeError::Faulted { faults: 3 }
    ));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn faulted_attempt_is_retried() {
    let cluster = start_cluster(&LogLines::default()).await;
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    let flaky = Cloud::new("flaky", move |_ctx| {
        let seen = Arc::clone(&seen);
        async move {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first attempt faults");
            }
            Ok::<_, anyhow::Error>(5)
        }
    });

    let value = cluster
        .client()
        .submit(flaky, None, FaultPolicy::InfiniteRetry { delay_ms: 1 })
        .await
        .unwrap();
    assert_eq!(value, 5);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn compilation_failure_allocates_nothing() {
    let cluster = start_cluster(&LogLines::default()).await;
    let workflow = Cloud::value("conflicted", 1)
        .with_dependency(Dependency::new("geo", "1.0.0"))
        .with_dependency(Dependency::new("geo", "2.0.0"));

    let err = cluster
        .client()
        .submit(workflow, None, FaultPolicy::NoRetry)
        .await
        .unwrap_err();
    assert!(matches!(
        runtime_error(&err),
        RuntimeError::CompilationError(_)
    ));
    assert_eq!(cluster.primitives().created_count(), 0);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dependencies_are_uploaded_before_running() {
    let cluster = start_cluster(&LogLines::default()).await;
    let geo = Dependency::new("geo", "1.0.0");
    let workflow = Cloud::value("with-deps", "done".to_string()).with_dependency(geo.clone());

    let value = cluster
        .client()
        .submit(workflow, None, FaultPolicy::NoRetry)
        .await
        .unwrap();
    assert_eq!(value, "done");
    assert!(
        cluster
            .manager()
            .assembly_manager()
            .is_uploaded(&geo.id())
            .await
    );
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn job_log_lines_reach_the_cluster_logger() {
    let logs = LogLines::default();
    let cluster = start_cluster(&logs).await;
    let workflow = Cloud::new("chatty", |ctx: ExecutionContext| async move {
        ctx.log("computing the answer");
        Ok::<_, anyhow::Error>(())
    });

    cluster
        .client()
        .submit(workflow, None, FaultPolicy::NoRetry)
        .await
        .unwrap();
    assert!(eventually(|| logs.contains("computing the answer")).await);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn workflows_see_cluster_resources() {
    let cluster = start_cluster(&LogLines::default()).await;
    let workflow = Cloud::new("store-id", |ctx: ExecutionContext| async move {
        let store = ctx.resources().require::<dyn StoreProvider>()?;
        Ok::<_, anyhow::Error>(store.id().to_string())
    });

    let id = cluster
        .client()
        .submit(workflow, None, FaultPolicy::NoRetry)
        .await
        .unwrap();
    assert_eq!(id, "memory");
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_as_task_and_blocking_run() {
    let cluster = start_cluster(&LogLines::default()).await;

    let handle = cluster
        .client()
        .submit_as_task(Cloud::value("task", 7), None, FaultPolicy::NoRetry);
    assert_eq!(handle.await.unwrap().unwrap(), 7);

    let client = cluster.client().clone();
    let value = tokio::task::spawn_blocking(move || {
        client.run(Cloud::value("blocking", 9), None, FaultPolicy::NoRetry)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(value, 9);

    assert_eq!(cluster.primitives().created_count(), 2);
    assert_eq!(cluster.primitives().cancelled_count(), 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn run_local_skips_the_job_queue() {
    let logs = LogLines::default();
    let cluster = start_cluster(&logs).await;
    let workflow = Cloud::new("inline", |ctx: ExecutionContext| async move {
        ctx.log("ran inline");
        Ok::<_, anyhow::Error>(ctx.process().default_work_directory().to_string())
    });

    let directory = cluster.client().run_local(workflow).await.unwrap();
    assert!(directory.starts_with("processes/"));
    assert!(logs.contains("ran inline"));
    assert_eq!(cluster.primitives().created_count(), 0);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_submissions_release_their_entries() {
    let cluster = start_cluster(&LogLines::default()).await;
    for n in 0..200 {
        let value = cluster
            .client()
            .submit(Cloud::value("repeat", n), None, FaultPolicy::NoRetry)
            .await
            .unwrap();
        assert_eq!(value, n);
    }
    assert_eq!(cluster.primitives().created_count(), 200);
    assert_eq!(cluster.primitives().cancelled_count(), 200);
    assert_eq!(cluster.primitives().live_count(), 0);
    cluster.shutdown().await;
}
