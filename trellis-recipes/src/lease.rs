//! Semaphore leases.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use trellis_framework::Framework;
use trellis_framework::paths::node_name;

use crate::error::Result;

/// One granted slot of an [`InterProcessSemaphore`](crate::InterProcessSemaphore).
///
/// The slot is backed by an ephemeral node, so it is revoked if the owning
/// session expires. Dropping a lease releases it in the background; call
/// [`release`](Self::release) to release it and observe the outcome.
pub struct Lease {
    framework: Framework,
    path: String,
    semaphore_path: String,
    data: Vec<u8>,
    released: AtomicBool,
    revoked: AtomicBool,
}

impl Lease {
    pub(crate) fn new(
        framework: Framework,
        path: String,
        semaphore_path: String,
        data: Vec<u8>,
    ) -> Self {
        Self {
            framework,
            path,
            semaphore_path,
            data,
            released: AtomicBool::new(false),
            revoked: AtomicBool::new(false),
        }
    }

    /// Full path of the node backing this lease.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn node_name(&self) -> &str {
        node_name(&self.path)
    }

    pub fn semaphore_path(&self) -> &str {
        &self.semaphore_path
    }

    /// Data the lease node was created with.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Whether the lease was found to have been taken away, by session
    /// expiry or by someone deleting its node.
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Release the lease.
    ///
    /// Returns `Ok(true)` if this call removed the lease node and `Ok(false)`
    /// if the lease was already released or revoked. On error the lease is
    /// still held and the call may be repeated.
    pub async fn release(&self) -> Result<bool> {
        if self.is_revoked() || self.released.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        match self.framework.delete_if_exists(&self.path).await {
            Ok(true) => {
                debug!(path = %self.path, "Released lease");
                Ok(true)
            }
            Ok(false) => {
                warn!(path = %self.path, "Lease node was already gone on release");
                self.revoked.store(true, Ordering::Release);
                Ok(false)
            }
            Err(e) => {
                self.released.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Check that the lease is still held.
    pub async fn check(&self) -> Result<bool> {
        if self.is_released() || self.is_revoked() {
            return Ok(false);
        }
        if self.framework.exists(&self.path).await? {
            return Ok(true);
        }

        warn!(path = %self.path, "Lease revoked");
        self.revoked.store(true, Ordering::Release);
        Ok(false)
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("path", &self.path)
            .field("released", &self.is_released())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.is_released() || self.is_revoked() {
            return;
        }

        // Best-effort release; the node is ephemeral and goes with the
        // session if this never runs.
        let Ok(runtime) = Handle::try_current() else {
            warn!(path = %self.path, "Lease dropped outside a runtime; left to session expiry");
            return;
        };
        let framework = self.framework.clone();
        let path = std::mem::take(&mut self.path);
        runtime.spawn(async move {
            if let Err(e) = framework.delete_if_exists(&path).await {
                warn!(path = %path, error = %e, "Failed to release dropped lease");
            }
        });
    }
}
