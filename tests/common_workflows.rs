//! Integration tests for common Trellis workflows.
//!
//! These tests go through the facade crate the way applications do.

use std::sync::Arc;
use std::time::Duration;

use trellis::prelude::*;
use trellis::{DynamicEnsembleProvider, RetryNTimes};

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn test_framework_from_client_config() {
    let cluster = TestingCluster::new(3);
    let config = ClientConfig::builder()
        .connect_string(cluster.connect_string())
        .session_timeout(Duration::from_secs(2))
        .connection_timeout(Duration::from_millis(500))
        .build();

    let framework = FrameworkBuilder::from_config(&config)
        .handle_factory(Arc::new(cluster.clone()))
        .build()
        .unwrap();
    framework.start().await.unwrap();

    framework
        .create_with_parents("/services/api/config", b"v1", CreateMode::Persistent)
        .await
        .unwrap();
    framework.set_data("/services/api/config", b"v2").await.unwrap();

    assert_eq!(cluster.data("/services/api/config"), Some(b"v2".to_vec()));
    assert_eq!(framework.get_children("/services").await.unwrap(), vec!["api"]);
    framework.close().await.unwrap();
}

// =============================================================================
// Ensemble changes
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_framework_follows_ensemble_replacement() {
    let timing = Timing::new();
    let cluster = TestingCluster::new(3);
    let provider = Arc::new(DynamicEnsembleProvider::new(&cluster.connect_string()));
    let framework = FrameworkBuilder::new()
        .ensemble_provider(provider.clone())
        .handle_factory(Arc::new(cluster.clone()))
        .session_timeout(timing.session())
        .connection_timeout(timing.connection())
        .retry_policy(Arc::new(RetryNTimes::new(5, Duration::from_millis(20))))
        .build()
        .unwrap();
    framework.start().await.unwrap();

    framework
        .create("/persistent", b"kept", CreateMode::Persistent)
        .await
        .unwrap();
    framework
        .create("/ephemeral", b"", CreateMode::Ephemeral)
        .await
        .unwrap();

    let moved_to = cluster.replace_endpoints();
    assert!(provider.set_connection_string(&moved_to).await);

    let deadline = tokio::time::Instant::now() + timing.wait();
    loop {
        if let Ok(data) = framework.get_data("/persistent").await {
            assert_eq!(data, b"kept");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        timing.sleep_a_bit().await;
    }

    assert_eq!(
        framework.client().connection_string().as_deref(),
        Some(moved_to.as_str())
    );
    assert!(!framework.exists("/ephemeral").await.unwrap());
    framework.close().await.unwrap();
}

// =============================================================================
// Idle supervisor
// =============================================================================

#[tokio::test]
async fn test_idle_framework_reopens_on_use() {
    let cluster = TestingCluster::new(1);
    let temp = FrameworkBuilder::new()
        .connect_string(cluster.connect_string())
        .handle_factory(Arc::new(cluster.clone()))
        .build_temp(Duration::from_millis(100))
        .unwrap();

    assert!(temp.exists("/").await.unwrap());
    assert_eq!(cluster.live_sessions(), 1);

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(cluster.live_sessions(), 0);

    assert!(temp.get_children("/").await.unwrap().is_empty());
    assert_eq!(cluster.sessions_created(), 2);
    temp.close().await.unwrap();
}

// =============================================================================
// Semaphores
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_semaphore_through_prelude() {
    let cluster = TestingCluster::new(3);
    let framework = FrameworkBuilder::new()
        .connect_string(cluster.connect_string())
        .handle_factory(Arc::new(cluster.clone()))
        .build()
        .unwrap();
    framework.start().await.unwrap();

    let limit = SharedCount::new(1);
    let semaphore = InterProcessSemaphore::new(framework.clone(), "/jobs", limit.clone());

    let first = semaphore.acquire().await.unwrap();
    assert!(semaphore.try_acquire().await.unwrap().is_none());

    limit.set(2);
    let second = semaphore.try_acquire().await.unwrap();
    assert!(second.is_some());
    assert_eq!(semaphore.participant_nodes().await.unwrap().len(), 2);

    assert!(first.release().await.unwrap());
    drop(second);
    framework.close().await.unwrap();
}
