//! Lock abstraction.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::lease::Lease;

/// A lock or semaphore whose grants are [`Lease`]s.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire a lease, waiting as long as it takes.
    async fn acquire(&self) -> Result<Lease>;

    /// Try to acquire a lease without waiting.
    async fn try_acquire(&self) -> Result<Option<Lease>>;

    /// Acquire a lease, giving up after `timeout`.
    async fn acquire_timeout(&self, timeout: Duration) -> Result<Lease>;
}
