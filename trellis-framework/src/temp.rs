//! Idle supervisor.
//!
//! [`TempFramework`] keeps a framework only while it is being used. The first
//! operation connects; a periodic check closes the connection once nothing
//! has touched it for the inactive threshold, and the next operation
//! reconnects. Dropping the supervisor closes an open client in the
//! background.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use trellis_client::Result;

use crate::builder::FrameworkBuilder;
use crate::framework::Framework;

struct TempState {
    client: Option<Framework>,
    cleanup: Option<JoinHandle<()>>,
    last_access: Instant,
}

struct TempInner {
    builder: FrameworkBuilder,
    inactive_threshold: Duration,
    state: Mutex<TempState>,
}

impl TempInner {
    /// Close the client if it has been idle for the threshold. Returns
    /// whether the check is done for this client.
    async fn close_if_inactive(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.last_access.elapsed() < self.inactive_threshold {
            return false;
        }

        info!(
            threshold_ms = self.inactive_threshold.as_millis() as u64,
            "Closing idle framework"
        );
        // this runs on the cleanup task itself; dropping the handle detaches it
        state.cleanup = None;
        if let Some(client) = state.client.take()
            && let Err(e) = client.close().await
        {
            error!(error = %e, "Failed to close idle framework");
        }
        true
    }
}

/// A framework that connects on demand and closes itself when idle.
pub struct TempFramework {
    inner: Arc<TempInner>,
}

impl TempFramework {
    pub(crate) fn new(builder: FrameworkBuilder, inactive_threshold: Duration) -> Self {
        Self {
            inner: Arc::new(TempInner {
                builder,
                inactive_threshold,
                state: Mutex::new(TempState {
                    client: None,
                    cleanup: None,
                    last_access: Instant::now(),
                }),
            }),
        }
    }

    pub fn inactive_threshold(&self) -> Duration {
        self.inner.inactive_threshold
    }

    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.framework().await?.get_data(path).await
    }

    pub async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.framework().await?.get_children(path).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.framework().await?.exists(path).await
    }

    /// Stop the idle check and close the client. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if let Some(cleanup) = state.cleanup.take() {
            cleanup.abort();
        }
        match state.client.take() {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }

    pub async fn has_client(&self) -> bool {
        self.inner.state.lock().await.client.is_some()
    }

    pub async fn has_cleanup(&self) -> bool {
        self.inner.state.lock().await.cleanup.is_some()
    }

    /// Mark the framework as used now.
    pub async fn update_last_access(&self) {
        self.inner.state.lock().await.last_access = Instant::now();
    }

    /// The connected framework, opening it if needed.
    async fn framework(&self) -> Result<Framework> {
        let mut state = self.inner.state.lock().await;

        let framework = match &state.client {
            Some(framework) => framework.clone(),
            None => {
                debug!("Opening framework on demand");
                let framework = self.inner.builder.build()?;
                framework.start().await?;
                state.client = Some(framework.clone());
                framework
            }
        };

        if state.cleanup.is_none() {
            state.cleanup = Some(self.spawn_cleanup());
        }
        state.last_access = Instant::now();

        Ok(framework)
    }

    fn spawn_cleanup(&self) -> JoinHandle<()> {
        let threshold = self.inner.inactive_threshold;
        let inner: Weak<TempInner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + threshold, threshold);
            loop {
                interval.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if inner.close_if_inactive().await {
                    break;
                }
            }
        })
    }
}

impl Drop for TempFramework {
    fn drop(&mut self) {
        let Ok(runtime) = Handle::try_current() else {
            // no runtime to close on; at least stop the pending check
            if let Ok(mut state) = self.inner.state.try_lock()
                && let Some(cleanup) = state.cleanup.take()
            {
                cleanup.abort();
            }
            return;
        };

        let inner = self.inner.clone();
        runtime.spawn(async move {
            let mut state = inner.state.lock().await;
            if let Some(cleanup) = state.cleanup.take() {
                cleanup.abort();
            }
            if let Some(client) = state.client.take() {
                debug!("Closing framework of dropped supervisor");
                if let Err(e) = client.close().await {
                    error!(error = %e, "Failed to close framework of dropped supervisor");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_client::{CreateMode, HandleFactory, NoopWatcher};
    use trellis_testing::{TestingCluster, Timing};

    fn temp(cluster: &TestingCluster, threshold: Duration) -> TempFramework {
        FrameworkBuilder::new()
            .connect_string(cluster.connect_string())
            .handle_factory(Arc::new(cluster.clone()))
            .build_temp(threshold)
            .unwrap()
    }

    #[tokio::test]
    async fn test_connects_lazily() {
        let cluster = TestingCluster::new(1);
        let temp = temp(&cluster, Duration::from_secs(10));

        assert!(!temp.has_client().await);
        assert!(!temp.has_cleanup().await);
        assert_eq!(cluster.sessions_created(), 0);

        assert!(temp.exists("/").await.unwrap());
        assert!(temp.has_client().await);
        assert!(temp.has_cleanup().await);
        assert_eq!(cluster.sessions_created(), 1);

        temp.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_client_is_closed_and_reopened() {
        let cluster = TestingCluster::new(1);
        let temp = temp(&cluster, Duration::from_millis(100));

        assert!(temp.get_children("/").await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert!(!temp.has_client().await);
        assert!(!temp.has_cleanup().await);
        assert_eq!(cluster.live_sessions(), 0);

        assert!(temp.exists("/").await.unwrap());
        assert!(temp.has_client().await);
        assert_eq!(cluster.sessions_created(), 2);
        temp.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_access_keeps_client_open() {
        let cluster = TestingCluster::new(1);
        let setup = cluster
            .new_handle(
                &cluster.connect_string(),
                Duration::from_secs(5),
                Arc::new(NoopWatcher),
                false,
            )
            .await
            .unwrap();
        setup.create("/data", b"x", CreateMode::Persistent).await.unwrap();

        let temp = temp(&cluster, Duration::from_millis(200));
        for _ in 0..6 {
            assert_eq!(temp.get_data("/data").await.unwrap(), b"x");
            tokio::time::sleep(Duration::from_millis(60)).await;
            temp.update_last_access().await;
        }

        assert!(temp.has_client().await);
        assert_eq!(cluster.sessions_created(), 2);
        temp.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_closes_open_client() {
        let cluster = TestingCluster::new(1);
        let temp = temp(&cluster, Duration::from_secs(10));

        assert!(temp.exists("/").await.unwrap());
        assert_eq!(cluster.live_sessions(), 1);
        drop(temp);

        let timing = Timing::new();
        assert!(timing.eventually(|| cluster.live_sessions() == 0).await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let cluster = TestingCluster::new(1);
        let temp = temp(&cluster, Duration::from_secs(1));

        temp.exists("/").await.unwrap();
        temp.close().await.unwrap();
        temp.close().await.unwrap();

        assert!(!temp.has_client().await);
        assert!(!temp.has_cleanup().await);
        assert_eq!(cluster.live_sessions(), 0);
    }
}
