//! Runtime tokens handed to worker processes.

use stratus_runtime::{LocalDirectory, RuntimeDescriptor, RuntimeError, RuntimeState};

use crate::common::{LogLines, start_cluster};

#[tokio::test]
async fn token_round_trips_across_a_live_cluster() {
    let cluster = start_cluster(&LogLines::default()).await;
    let token = cluster.token();

    let decoded = RuntimeDescriptor::decode(&token).unwrap();
    assert_eq!(&decoded, cluster.descriptor());
    assert_eq!(decoded.encode().unwrap(), token);

    // Every service locator points at the driver node.
    for locator in [
        decoded.primitives(),
        decoded.worker_manager(),
        decoded.job_queue(),
        decoded.task_manager(),
        decoded.logger(),
    ] {
        assert_eq!(locator.address(), cluster.address());
    }

    let state = RuntimeState::from_token(&token, LocalDirectory::global()).unwrap();
    assert_eq!(state.descriptor(), cluster.descriptor());
    assert_eq!(state.to_token().unwrap(), token);

    cluster.shutdown().await;
}

#[tokio::test]
async fn token_of_stopped_cluster_no_longer_resolves() {
    let cluster = start_cluster(&LogLines::default()).await;
    let token = cluster.token();
    let id = cluster.descriptor().cluster();
    cluster.shutdown().await;

    assert!(!LocalDirectory::global().contains(id));
    let err = RuntimeState::from_token(&token, LocalDirectory::global())
        .err()
        .unwrap();
    assert!(matches!(err, RuntimeError::InvalidState(_)));
}

#[test]
fn garbage_tokens_are_malformed() {
    for token in ["", "not base64!", "e30", "eyJtYWdpYyI6Im5vcGUifQ"] {
        let err = RuntimeDescriptor::decode(token).unwrap_err();
        assert!(
            matches!(err, RuntimeError::MalformedDescriptor(_)),
            "{token:?} gave {err:?}"
        );
    }
}
