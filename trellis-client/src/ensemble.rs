//! Ensemble tracking.
//!
//! An [`EnsembleProvider`] owns the authoritative connection string and tells
//! registered [`EnsembleListener`]s when it changes. Listeners are invoked one
//! at a time, in registration order; a listener that fails or panics is logged
//! and skipped so the rest still hear about the change.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::Result;

/// Ordered list of `host:port` endpoints.
///
/// Order only matters for wire negotiation; two strings naming the same
/// endpoints describe the same ensemble.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionString {
    endpoints: Vec<String>,
}

impl ConnectionString {
    /// Parse a comma-separated endpoint list. Tokens are trimmed and empty
    /// tokens dropped; nothing else is validated.
    pub fn parse(value: &str) -> Self {
        let endpoints = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { endpoints }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Set comparison of the endpoints.
    pub fn same_ensemble(&self, other: &ConnectionString) -> bool {
        let ours: BTreeSet<&str> = self.endpoints.iter().map(String::as_str).collect();
        let theirs: BTreeSet<&str> = other.endpoints.iter().map(String::as_str).collect();
        ours == theirs
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoints.join(","))
    }
}

impl From<&str> for ConnectionString {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

/// Notified when the provider's connection string changes.
#[async_trait]
pub trait EnsembleListener: Send + Sync {
    async fn ensemble_changed(&self, provider: &dyn EnsembleProvider) -> Result<()>;
}

/// Source of the current connection string.
#[async_trait]
pub trait EnsembleProvider: Send + Sync {
    /// Called once before first use.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Latest known connection string. Must not block on network I/O.
    fn connection_string(&self) -> String;

    /// Register a listener. Adding the same listener twice has no effect.
    fn add_listener(&self, listener: Arc<dyn EnsembleListener>);

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Listener registry shared by provider implementations.
#[derive(Default)]
pub struct EnsembleListeners {
    listeners: RwLock<Vec<Arc<dyn EnsembleListener>>>,
}

impl EnsembleListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener unless this exact instance is already registered.
    pub fn add(&self, listener: Arc<dyn EnsembleListener>) -> bool {
        let mut listeners = self.listeners.write();
        let target = Arc::as_ptr(&listener) as *const ();
        if listeners
            .iter()
            .any(|l| Arc::as_ptr(l) as *const () == target)
        {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Invoke every listener once, in registration order.
    ///
    /// Returns the number of listeners that completed without error.
    pub async fn fire(&self, provider: &dyn EnsembleProvider) -> usize {
        let snapshot: Vec<_> = self.listeners.read().clone();
        let mut delivered = 0;

        for (index, listener) in snapshot.iter().enumerate() {
            let outcome = AssertUnwindSafe(listener.ensemble_changed(provider))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!(listener = index, error = %e, "Ensemble listener failed");
                }
                Err(_) => {
                    error!(listener = index, "Ensemble listener panicked");
                }
            }
        }

        debug!(
            listeners = snapshot.len(),
            delivered, "Ensemble change dispatched"
        );
        delivered
    }
}

/// Provider for a connection string that never changes.
pub struct FixedEnsembleProvider {
    connection_string: String,
}

impl FixedEnsembleProvider {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

#[async_trait]
impl EnsembleProvider for FixedEnsembleProvider {
    fn connection_string(&self) -> String {
        self.connection_string.clone()
    }

    fn add_listener(&self, _listener: Arc<dyn EnsembleListener>) {
        // never changes, nothing to deliver
    }
}

/// Provider whose connection string can be replaced at runtime.
#[derive(Default)]
pub struct DynamicEnsembleProvider {
    current: RwLock<ConnectionString>,
    listeners: EnsembleListeners,
}

impl DynamicEnsembleProvider {
    pub fn new(connection_string: &str) -> Self {
        Self {
            current: RwLock::new(ConnectionString::parse(connection_string)),
            listeners: EnsembleListeners::new(),
        }
    }

    /// Replace the connection string.
    ///
    /// Listeners fire only when the new value names a different set of
    /// endpoints. Returns whether they fired.
    ///
    /// ```
    /// use trellis_client::{DynamicEnsembleProvider, EnsembleProvider};
    ///
    /// # tokio_test::block_on(async {
    /// let provider = DynamicEnsembleProvider::new("zk1:2181,zk2:2181");
    /// assert!(!provider.set_connection_string("zk2:2181, zk1:2181").await);
    /// assert!(provider.set_connection_string("zk3:2181").await);
    /// assert_eq!(provider.connection_string(), "zk3:2181");
    /// # });
    /// ```
    pub async fn set_connection_string(&self, value: &str) -> bool {
        let next = ConnectionString::parse(value);
        {
            let mut current = self.current.write();
            if current.same_ensemble(&next) {
                *current = next;
                return false;
            }
            info!(from = %*current, to = %next, "Ensemble changed");
            *current = next;
        }
        self.listeners.fire(self).await;
        true
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[async_trait]
impl EnsembleProvider for DynamicEnsembleProvider {
    fn connection_string(&self) -> String {
        self.current.read().to_string()
    }

    fn add_listener(&self, listener: Arc<dyn EnsembleListener>) {
        self.listeners.add(listener);
    }
}
