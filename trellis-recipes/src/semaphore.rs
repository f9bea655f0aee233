//! Distributed counting semaphore.
//!
//! Each acquirer creates an ephemeral sequential reservation under the
//! semaphore path. A reservation holds a lease while fewer than
//! `max_leases` reservations carry a lower sequence number, so leases are
//! granted in arrival order. Waiters watch the children of the semaphore
//! path and re-evaluate their rank whenever it changes.

use async_trait::async_trait;
use std::future::{Future, pending};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tracing::{debug, info, warn};

use trellis_client::{CoordinationError, CreateMode, FnWatcher};
use trellis_framework::paths::{make_path, node_name, sequence_of, sort_by_sequence};
use trellis_framework::{ConnectionState, Framework};

use crate::count::MaxLeases;
use crate::error::{LockError, Result};
use crate::lease::Lease;
use crate::lock::DistributedLock;

const LEASE_NAME: &str = "lease-";

/// Pause before reserving again after the session expired under us.
const RESTART_DELAY: Duration = Duration::from_millis(10);

enum Grant {
    Granted,
    /// The reservation is gone, taken with an expired session.
    Vanished,
}

/// A counting semaphore shared by every process using the same path.
///
/// # Examples
///
/// ```rust,ignore
/// use trellis_recipes::{DistributedLock, InterProcessSemaphore};
/// use std::time::Duration;
///
/// let semaphore = InterProcessSemaphore::new(framework, "/locks/reports", 2);
/// let lease = semaphore.acquire_timeout(Duration::from_secs(5)).await?;
/// // at most two holders run this section at once
/// lease.release().await?;
/// ```
pub struct InterProcessSemaphore {
    framework: Framework,
    path: String,
    max_leases: MaxLeases,
    node_data: Vec<u8>,
}

impl InterProcessSemaphore {
    pub fn new(framework: Framework, path: impl Into<String>, max_leases: impl Into<MaxLeases>) -> Self {
        Self {
            framework,
            path: path.into(),
            max_leases: max_leases.into(),
            node_data: Vec::new(),
        }
    }

    /// A semaphore with a single lease.
    pub fn mutex(framework: Framework, path: impl Into<String>) -> Self {
        Self::new(framework, path, 1)
    }

    /// Store `data` in every reservation this semaphore creates.
    pub fn with_node_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.node_data = data.into();
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn max_leases(&self) -> usize {
        self.max_leases.current()
    }

    /// Acquire `qty` leases, waiting at most `timeout` for all of them.
    ///
    /// Either every lease is returned or none is: leases already granted are
    /// released before an error is returned.
    pub async fn acquire_many(&self, qty: usize, timeout: Option<Duration>) -> Result<Vec<Lease>> {
        if qty == 0 {
            return Err(LockError::InvalidArgument("qty must be at least 1".into()));
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut leases = Vec::with_capacity(qty);
        for _ in 0..qty {
            match self.acquire_until(deadline).await {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    for lease in leases {
                        if let Err(release_error) = lease.release().await {
                            warn!(path = %lease.path(), error = %release_error, "Failed to return lease");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(leases)
    }

    /// Reservation node names, in grant order.
    pub async fn participant_nodes(&self) -> Result<Vec<String>> {
        let mut children = match self.framework.get_children(&self.path).await {
            Ok(children) => children,
            Err(CoordinationError::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        sort_by_sequence(&mut children);
        Ok(children)
    }

    async fn acquire_until(&self, deadline: Option<Instant>) -> Result<Lease> {
        let mut states = self.framework.subscribe_connection_state();
        let mut limits = self.max_leases.subscribe();
        let prefix = make_path(&self.path, LEASE_NAME);

        loop {
            let reserve = self.framework.create_protected(
                &prefix,
                &self.node_data,
                CreateMode::EphemeralSequential,
            );
            let node = match self.bounded(deadline, reserve).await {
                Ok(node) => node,
                Err(e) if e.is_session_expired() => {
                    debug!(semaphore = %self.path, "Session expired while reserving");
                    restart_pause(deadline).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut reservation = Reservation::new(self.framework.clone(), node.clone());

            match self
                .wait_for_grant(&node, deadline, &mut states, &mut limits)
                .await
            {
                Ok(Grant::Granted) => {
                    reservation.disarm();
                    info!(semaphore = %self.path, lease = %node, "Acquired lease");
                    return Ok(Lease::new(
                        self.framework.clone(),
                        node,
                        self.path.clone(),
                        self.node_data.clone(),
                    ));
                }
                Ok(Grant::Vanished) => {
                    reservation.disarm();
                    debug!(semaphore = %self.path, node = %node, "Reservation vanished; reserving again");
                }
                Err(e) if e.is_session_expired() => {
                    reservation.disarm();
                    debug!(semaphore = %self.path, "Session expired while waiting");
                    restart_pause(deadline).await?;
                }
                Err(e) => {
                    reservation.remove().await;
                    return Err(e);
                }
            }
        }
    }

    async fn wait_for_grant(
        &self,
        node: &str,
        deadline: Option<Instant>,
        states: &mut broadcast::Receiver<ConnectionState>,
        limits: &mut Option<watch::Receiver<usize>>,
    ) -> Result<Grant> {
        let name = node_name(node);
        let sequence = sequence_of(name).ok_or_else(|| {
            CoordinationError::invalid_state(format!("reservation has no sequence: {node}"))
        })?;

        loop {
            let changed = Arc::new(Notify::new());
            let waker = changed.clone();
            let watcher = FnWatcher::shared(move |_| waker.notify_one());

            let listing = self.framework.get_children_watched(&self.path, Some(watcher));
            let children = match self.bounded(deadline, listing).await {
                Ok(children) => children,
                Err(LockError::Coordination(CoordinationError::NoNode(_))) => {
                    return Ok(Grant::Vanished);
                }
                Err(e) => return Err(e),
            };
            if !children.iter().any(|child| child == name) {
                return Ok(Grant::Vanished);
            }

            let ahead = children
                .iter()
                .filter_map(|child| sequence_of(child))
                .filter(|other| *other < sequence)
                .count();
            let max_leases = self.max_leases.current();
            if ahead < max_leases {
                return Ok(Grant::Granted);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(LockError::Timeout);
            }

            debug!(semaphore = %self.path, ahead, max_leases, "Waiting for lease");
            loop {
                tokio::select! {
                    _ = changed.notified() => break,
                    _ = limit_changed(limits) => break,
                    state = states.recv() => match state {
                        // nothing to re-list until the connection is back
                        Ok(ConnectionState::Suspended) => continue,
                        _ => break,
                    },
                    _ = until(deadline) => return Err(LockError::Timeout),
                }
            }
        }
    }

    /// Run a coordination call under the acquire deadline. Each call gets
    /// at least one connection timeout, so a zero-wait attempt can still
    /// reach the ensemble.
    async fn bounded<T, F>(&self, deadline: Option<Instant>, call: F) -> Result<T>
    where
        F: Future<Output = trellis_client::Result<T>>,
    {
        let Some(deadline) = deadline else {
            return Ok(call.await?);
        };
        let floor = Instant::now() + self.framework.client().connection_timeout();
        match timeout_at(deadline.max(floor), call).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                debug!(semaphore = %self.path, "Deadline passed during coordination call");
                Err(LockError::Timeout)
            }
        }
    }
}

#[async_trait]
impl DistributedLock for InterProcessSemaphore {
    async fn acquire(&self) -> Result<Lease> {
        self.acquire_until(None).await
    }

    async fn try_acquire(&self) -> Result<Option<Lease>> {
        match self.acquire_until(Some(Instant::now())).await {
            Ok(lease) => Ok(Some(lease)),
            Err(LockError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn acquire_timeout(&self, timeout: Duration) -> Result<Lease> {
        self.acquire_until(Some(Instant::now() + timeout)).await
    }
}

/// A reservation node that is deleted unless it becomes a lease.
struct Reservation {
    framework: Framework,
    path: Option<String>,
}

impl Reservation {
    fn new(framework: Framework, path: String) -> Self {
        Self {
            framework,
            path: Some(path),
        }
    }

    fn disarm(&mut self) {
        self.path = None;
    }

    async fn remove(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match self.framework.delete_if_exists(&path).await {
            Ok(_) => debug!(path = %path, "Removed reservation"),
            Err(e) => warn!(path = %path, error = %e, "Failed to remove reservation"),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // the acquiring future was dropped mid-wait
        if let Some(path) = self.path.take()
            && let Ok(runtime) = Handle::try_current()
        {
            let framework = self.framework.clone();
            runtime.spawn(async move {
                if let Err(e) = framework.delete_if_exists(&path).await {
                    warn!(path = %path, error = %e, "Failed to remove abandoned reservation");
                }
            });
        }
    }
}

async fn limit_changed(limits: &mut Option<watch::Receiver<usize>>) {
    if let Some(limits) = limits
        && limits.changed().await.is_ok()
    {
        return;
    }
    pending().await
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn restart_pause(deadline: Option<Instant>) -> Result<()> {
    let delay = match deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LockError::Timeout);
            }
            remaining.min(RESTART_DELAY)
        }
        None => RESTART_DELAY,
    };
    sleep(delay).await;
    Ok(())
}
