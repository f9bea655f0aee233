//! Lost replies on top of a [`TestingCluster`].
//!
//! A request can reach the ensemble and be applied while its reply never
//! makes it back. [`FaultyCluster`] opens ordinary cluster sessions and
//! drops chosen create replies, answering with
//! [`CoordinationError::ConnectionLoss`] although the node exists.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use trellis_client::{CoordinationError, CreateMode, HandleFactory, Result, Session, Watcher};

use crate::TestingCluster;

#[derive(Default)]
struct Faults {
    lost_create_replies: AtomicUsize,
    partition_after_lost_reply: AtomicBool,
    partitioned: AtomicBool,
}

impl Faults {
    fn take_lost_reply(&self) -> bool {
        self.lost_create_replies
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check(&self) -> Result<()> {
        if self.partitioned.load(Ordering::Acquire) {
            return Err(CoordinationError::ConnectionLoss);
        }
        Ok(())
    }
}

/// Handle factory over a [`TestingCluster`] that can lose replies.
///
/// While partitioned, every call on every session it opened fails with
/// connection loss without reaching the cluster. Sessions stay alive on the
/// cluster side.
#[derive(Clone)]
pub struct FaultyCluster {
    cluster: TestingCluster,
    faults: Arc<Faults>,
}

impl FaultyCluster {
    pub fn new(cluster: TestingCluster) -> Self {
        Self {
            cluster,
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn cluster(&self) -> &TestingCluster {
        &self.cluster
    }

    /// Apply the next `count` creates but answer each with connection loss.
    pub fn lose_create_replies(&self, count: usize) {
        self.faults
            .lost_create_replies
            .store(count, Ordering::Release);
    }

    /// Partition right after a lost reply, until [`heal`](Self::heal).
    pub fn partition_after_lost_reply(&self, enabled: bool) {
        self.faults
            .partition_after_lost_reply
            .store(enabled, Ordering::Release);
    }

    pub fn partition(&self) {
        self.faults.partitioned.store(true, Ordering::Release);
    }

    pub fn heal(&self) {
        self.faults.partitioned.store(false, Ordering::Release);
    }

    pub fn is_partitioned(&self) -> bool {
        self.faults.partitioned.load(Ordering::Acquire)
    }
}

#[async_trait]
impl HandleFactory for FaultyCluster {
    async fn new_handle(
        &self,
        connection_string: &str,
        session_timeout: Duration,
        watcher: Arc<dyn Watcher>,
        can_be_read_only: bool,
    ) -> Result<Arc<dyn Session>> {
        let inner = self
            .cluster
            .new_handle(connection_string, session_timeout, watcher, can_be_read_only)
            .await?;
        Ok(Arc::new(FaultySession {
            inner,
            faults: self.faults.clone(),
        }))
    }
}

struct FaultySession {
    inner: Arc<dyn Session>,
    faults: Arc<Faults>,
}

#[async_trait]
impl Session for FaultySession {
    fn session_id(&self) -> Option<i64> {
        self.inner.session_id()
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.faults.check()?;
        let created = self.inner.create(path, data, mode).await?;
        if self.faults.take_lost_reply() {
            debug!(path = %created, "Dropping create reply");
            if self.faults.partition_after_lost_reply.load(Ordering::Acquire) {
                self.faults.partitioned.store(true, Ordering::Release);
            }
            return Err(CoordinationError::ConnectionLoss);
        }
        Ok(created)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.faults.check()?;
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<bool> {
        self.faults.check()?;
        self.inner.exists(path, watcher).await
    }

    async fn get_data(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Vec<u8>> {
        self.faults.check()?;
        self.inner.get_data(path, watcher).await
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        self.faults.check()?;
        self.inner.set_data(path, data).await
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Vec<String>> {
        self.faults.check()?;
        self.inner.get_children(path, watcher).await
    }

    fn register(&self, watcher: Arc<dyn Watcher>) {
        self.inner.register(watcher);
    }

    async fn update_server_list(&self, connection_string: &str) -> Result<()> {
        self.inner.update_server_list(connection_string).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
