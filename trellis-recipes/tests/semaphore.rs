//! Semaphore behavior with many clients sharing one cluster.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing_subscriber::EnvFilter;
use trellis_client::RetryNTimes;
use trellis_framework::{Framework, FrameworkBuilder};
use trellis_recipes::{DistributedLock, InterProcessSemaphore, LockError};
use trellis_client::{CoordinationError, HandleFactory};
use trellis_testing::{FaultyCluster, TestingCluster, Timing};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn framework(cluster: &TestingCluster, timing: &Timing) -> Framework {
    let retry = RetryNTimes::new(3, Duration::from_millis(20));
    framework_with(Arc::new(cluster.clone()), cluster, timing, retry).await
}

async fn framework_with(
    factory: Arc<dyn HandleFactory>,
    cluster: &TestingCluster,
    timing: &Timing,
    retry: RetryNTimes,
) -> Framework {
    let framework = FrameworkBuilder::new()
        .connect_string(cluster.connect_string())
        .handle_factory(factory)
        .session_timeout(timing.session())
        .connection_timeout(timing.connection())
        .retry_policy(Arc::new(retry))
        .build()
        .unwrap();
    framework.start().await.unwrap();
    framework
}

/// Tracks how many holders are inside the guarded section at once.
#[derive(Default)]
struct Occupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    fn enter(&self) -> usize {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        now
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

async fn run_clients(clients: usize, max_leases: usize, rounds: usize) -> Arc<Occupancy> {
    let timing = Timing::new();
    let cluster = TestingCluster::new(3);
    let occupancy = Arc::new(Occupancy::default());

    let mut tasks = Vec::new();
    for _ in 0..clients {
        let framework = framework(&cluster, &timing).await;
        let occupancy = occupancy.clone();
        tasks.push(tokio::spawn(async move {
            let semaphore = InterProcessSemaphore::new(framework.clone(), "/counted", max_leases);
            for _ in 0..rounds {
                let lease = semaphore.acquire_timeout(timing.wait()).await.unwrap();
                let inside = occupancy.enter();
                assert!(inside <= max_leases, "{inside} holders with {max_leases} leases");

                let pause = rand::rng().random_range(1..10);
                tokio::time::sleep(Duration::from_millis(pause)).await;

                occupancy.leave();
                assert!(lease.release().await.unwrap());
            }
            framework.close().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(cluster.children("/counted").is_empty());
    occupancy
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_clients_share_one_lease() {
    init_tracing();
    let occupancy = run_clients(10, 1, 3).await;
    assert_eq!(occupancy.peak(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_never_more_than_max_leases() {
    init_tracing();
    let occupancy = run_clients(8, 3, 4).await;
    assert!(occupancy.peak() <= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiters_are_granted_in_arrival_order() {
    init_tracing();
    let timing = Timing::new();
    let cluster = TestingCluster::new(1);
    let owner = framework(&cluster, &timing).await;
    let semaphore = InterProcessSemaphore::mutex(owner.clone(), "/fifo");
    let held = semaphore.acquire().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for index in 0..4 {
        let framework = framework(&cluster, &timing).await;
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let semaphore = InterProcessSemaphore::mutex(framework.clone(), "/fifo");
            let lease = semaphore.acquire_timeout(timing.wait()).await.unwrap();
            order.lock().push(index);
            lease.release().await.unwrap();
            framework.close().await.unwrap();
        }));
        // queue each waiter before the next one arrives
        assert!(timing.eventually(|| cluster.children("/fifo").len() == index + 2).await);
    }

    held.release().await.unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    owner.close().await.unwrap();
}

#[tokio::test]
async fn test_timeout_leaves_no_reservation() {
    init_tracing();
    let timing = Timing::new();
    let cluster = TestingCluster::new(1);
    let framework = framework(&cluster, &timing).await;
    let semaphore = InterProcessSemaphore::mutex(framework.clone(), "/timeout");

    let held = semaphore.acquire().await.unwrap();
    let started = tokio::time::Instant::now();
    let result = semaphore.acquire_timeout(Duration::from_millis(150)).await;

    assert!(matches!(result, Err(LockError::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(cluster.children("/timeout"), vec![held.node_name().to_string()]);

    held.release().await.unwrap();
    assert!(cluster.children("/timeout").is_empty());
    framework.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiter_is_granted_after_quorum_loss_expires_holder() {
    init_tracing();
    let timing = Timing::with_base(Duration::from_millis(60));
    let cluster = TestingCluster::new(3);

    let holder = framework(&cluster, &timing).await;
    let held = InterProcessSemaphore::mutex(holder.clone(), "/outage")
        .acquire()
        .await
        .unwrap();

    let waiter = framework(&cluster, &timing).await;
    let task = {
        let waiter = waiter.clone();
        tokio::spawn(async move {
            InterProcessSemaphore::mutex(waiter, "/outage")
                .acquire_timeout(timing.wait())
                .await
        })
    };
    assert!(timing.eventually(|| cluster.children("/outage").len() == 2).await);

    cluster.stop();
    tokio::time::sleep(timing.session() * 2).await;
    assert!(!task.is_finished());
    cluster.start();

    // both sessions expired with the outage; the waiter queues again and,
    // with the holder's reservation gone, is granted
    let lease = task.await.unwrap().unwrap();
    assert!(lease.check().await.unwrap());
    assert!(!cluster.exists(held.path()));
    assert_eq!(cluster.children("/outage"), vec![lease.node_name().to_string()]);

    assert!(!held.release().await.unwrap_or(false));
    lease.release().await.unwrap();
    waiter.close().await.unwrap();
    holder.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_reservation_reply_does_not_hold_a_lease() {
    init_tracing();
    let timing = Timing::new();
    let cluster = TestingCluster::new(1);
    let faulty = FaultyCluster::new(cluster.clone());

    let other = framework(&cluster, &timing).await;
    other.ensure_path("/lost").await.unwrap();
    let unlucky = framework_with(
        Arc::new(faulty.clone()),
        &cluster,
        &timing,
        RetryNTimes::new(3, Duration::from_millis(20)),
    )
    .await;

    faulty.partition_after_lost_reply(true);
    faulty.lose_create_replies(1);
    let result = InterProcessSemaphore::mutex(unlucky.clone(), "/lost")
        .acquire_timeout(timing.wait())
        .await;
    assert!(matches!(
        result,
        Err(LockError::Coordination(CoordinationError::ConnectionLoss))
    ));
    assert_eq!(cluster.children("/lost").len(), 1);

    faulty.heal();
    let lease = InterProcessSemaphore::mutex(other.clone(), "/lost")
        .acquire_timeout(timing.wait())
        .await
        .unwrap();
    assert_eq!(cluster.children("/lost"), vec![lease.node_name().to_string()]);

    lease.release().await.unwrap();
    unlucky.close().await.unwrap();
    other.close().await.unwrap();
}

#[tokio::test]
async fn test_timeout_bounds_retried_calls() {
    init_tracing();
    let timing = Timing::new();
    let cluster = TestingCluster::new(1);
    let faulty = FaultyCluster::new(cluster.clone());
    // retries alone would keep trying for about twenty seconds
    let framework = framework_with(
        Arc::new(faulty.clone()),
        &cluster,
        &timing,
        RetryNTimes::new(1000, Duration::from_millis(20)),
    )
    .await;

    faulty.partition();
    let started = tokio::time::Instant::now();
    let result = InterProcessSemaphore::mutex(framework.clone(), "/bounded")
        .acquire_timeout(Duration::from_millis(150))
        .await;

    assert!(matches!(result, Err(LockError::Timeout)));
    assert!(started.elapsed() < Duration::from_millis(150) + timing.connection() * 2);

    faulty.heal();
    framework.close().await.unwrap();
}
