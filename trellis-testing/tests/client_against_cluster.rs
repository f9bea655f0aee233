//! CoordinationClient behavior against the in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use trellis_client::{
    CoordinationClient, CoordinationError, CreateMode, DynamicEnsembleProvider, EnsembleProvider,
    FixedEnsembleProvider, RetryNTimes, call_with_retry,
};
use trellis_testing::{TestingCluster, Timing};

fn client(
    cluster: &TestingCluster,
    provider: Arc<dyn EnsembleProvider>,
    timing: &Timing,
) -> CoordinationClient {
    CoordinationClient::new(
        Arc::new(cluster.clone()),
        provider,
        timing.session(),
        timing.connection(),
        Arc::new(RetryNTimes::new(3, Duration::from_millis(20))),
        false,
    )
}

#[tokio::test]
async fn test_connects_and_creates_nodes() {
    let timing = Timing::new();
    let cluster = TestingCluster::new(3);
    let client = client(
        &cluster,
        Arc::new(FixedEnsembleProvider::new(cluster.connect_string())),
        &timing,
    );

    client.start().await.unwrap();
    assert!(client.block_until_connected().await.unwrap());

    let session = client.handle().await.unwrap();
    session
        .create("/node", b"data", CreateMode::Persistent)
        .await
        .unwrap();
    assert_eq!(cluster.data("/node"), Some(b"data".to_vec()));

    client.close().await.unwrap();
    assert_eq!(cluster.live_sessions(), 0);
}

#[tokio::test]
async fn test_expired_session_is_replaced_transparently() {
    let timing = Timing::new();
    let cluster = TestingCluster::new(3);
    let client = client(
        &cluster,
        Arc::new(FixedEnsembleProvider::new(cluster.connect_string())),
        &timing,
    );
    client.start().await.unwrap();
    assert!(client.block_until_connected().await.unwrap());

    let first = client.handle().await.unwrap().session_id();
    assert!(cluster.expire_session(first.unwrap()));

    let replaced = async {
        loop {
            if let Ok(session) = client.handle().await
                && session.session_id() != first
                && session.exists("/", None).await.is_ok()
            {
                return session;
            }
            timing.sleep_a_bit().await;
        }
    };
    let session = tokio::time::timeout(timing.wait(), replaced).await.unwrap();

    assert_eq!(cluster.sessions_created(), 2);
    assert!(session.session_id().is_some());
    assert!(timing.eventually(|| client.is_connected()).await);

    let created = call_with_retry(&client, || async {
        client.handle().await?.create("/after", b"", CreateMode::Persistent).await
    })
    .await
    .unwrap();
    assert_eq!(created, "/after");
}

#[tokio::test]
async fn test_quorum_loss_fails_fast_then_recovers() {
    let timing = Timing::new();
    let cluster = TestingCluster::new(3);
    let client = client(
        &cluster,
        Arc::new(FixedEnsembleProvider::new(cluster.connect_string())),
        &timing,
    );
    client.start().await.unwrap();
    assert!(client.block_until_connected().await.unwrap());
    let session = client.handle().await.unwrap();

    cluster.stop();
    assert!(timing.eventually(|| !client.is_connected()).await);
    assert_eq!(
        session.exists("/", None).await.err(),
        Some(CoordinationError::ConnectionLoss)
    );

    cluster.start();
    assert!(timing.eventually(|| client.is_connected()).await);
    assert!(client.handle().await.unwrap().exists("/", None).await.unwrap());
}

#[tokio::test]
async fn test_ensemble_change_moves_client_to_new_endpoints() {
    let timing = Timing::with_base(Duration::from_millis(50));
    let cluster = TestingCluster::new(3);
    let provider = Arc::new(DynamicEnsembleProvider::new(&cluster.connect_string()));
    let client = client(&cluster, provider.clone(), &timing);
    client.start().await.unwrap();
    assert!(client.block_until_connected().await.unwrap());

    let replacement = cluster.replace_endpoints();
    provider.set_connection_string(&replacement).await;

    let recovered = async {
        loop {
            if let Ok(session) = client.handle().await
                && session.exists("/", None).await.is_ok()
            {
                return;
            }
            timing.sleep_a_bit().await;
        }
    };
    tokio::time::timeout(timing.wait(), recovered).await.unwrap();

    assert_eq!(client.connection_string().as_deref(), Some(replacement.as_str()));
    assert!(cluster.sessions_created() >= 2);
}
