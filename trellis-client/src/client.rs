//! Coordination client.
//!
//! [`CoordinationClient`] drives a [`HandleHolder`]: it starts and closes it,
//! wires it to the ensemble provider, tracks connection state from session
//! events and replaces the session once it has expired or been unreachable
//! for longer than the configured timeouts.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::ensemble::{EnsembleListener, EnsembleProvider, FixedEnsembleProvider};
use crate::handle::{HandleHolder, HandleState};
use crate::retry::RetryPolicy;
use crate::session::{EventType, HandleFactory, KeeperState, Session, WatchedEvent, Watcher};
use crate::{CoordinationError, Result};

struct ClientInner {
    holder: HandleHolder,
    ensemble_provider: Arc<dyn EnsembleProvider>,
    ensemble_listener: Arc<dyn EnsembleListener>,
    retry_policy: RwLock<Arc<dyn RetryPolicy>>,
    session_timeout: Duration,
    connection_timeout: Duration,
    started: AtomicBool,
    connected: watch::Sender<bool>,
    connection_start: Mutex<Instant>,
    parent_watchers: RwLock<Vec<Arc<dyn Watcher>>>,
    instance_index: AtomicU64,
}

/// Session-owning client with connection-state tracking.
#[derive(Clone)]
pub struct CoordinationClient {
    inner: Arc<ClientInner>,
}

impl CoordinationClient {
    /// Create a client. Nothing connects until [`start`](Self::start).
    pub fn new(
        factory: Arc<dyn HandleFactory>,
        ensemble_provider: Arc<dyn EnsembleProvider>,
        session_timeout: Duration,
        connection_timeout: Duration,
        retry_policy: Arc<dyn RetryPolicy>,
        can_be_read_only: bool,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let watcher: Arc<dyn Watcher> = Arc::new(ConnectionWatcher {
                inner: weak.clone(),
            });
            let (connected, _) = watch::channel(false);

            ClientInner {
                holder: HandleHolder::new(
                    factory,
                    watcher,
                    ensemble_provider.clone(),
                    session_timeout,
                    can_be_read_only,
                ),
                ensemble_provider,
                ensemble_listener: Arc::new(HolderEnsembleListener {
                    inner: weak.clone(),
                }),
                retry_policy: RwLock::new(retry_policy),
                session_timeout,
                connection_timeout,
                started: AtomicBool::new(false),
                connected,
                connection_start: Mutex::new(Instant::now()),
                parent_watchers: RwLock::new(Vec::new()),
                instance_index: AtomicU64::new(0),
            }
        });

        Self { inner }
    }

    /// Create a client from configuration. The configuration must carry a
    /// connect string.
    pub fn from_config(config: &ClientConfig, factory: Arc<dyn HandleFactory>) -> Result<Self> {
        let connect_string = config
            .connect_string
            .clone()
            .ok_or_else(|| CoordinationError::Config("connect string is required".into()))?;

        Ok(Self::new(
            factory,
            Arc::new(FixedEnsembleProvider::new(connect_string)),
            config.session_timeout,
            config.connection_timeout,
            Arc::new(config.retry_policy()),
            config.can_be_read_only,
        ))
    }

    /// Start the ensemble provider and arm the handle holder.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(CoordinationError::invalid_state("client already started"));
        }

        info!("Starting coordination client");
        self.inner.ensemble_provider.start().await?;
        self.inner
            .ensemble_provider
            .add_listener(self.inner.ensemble_listener.clone());
        self.reset().await
    }

    /// Close the session and the ensemble provider. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        info!("Closing coordination client");
        self.inner.connected.send_replace(false);
        self.inner.holder.close_and_clear().await?;
        self.inner.ensemble_provider.close().await
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// The live session, created on first use.
    ///
    /// While disconnected, fails with `ConnectionLoss` once the attempt has
    /// outlasted the shorter of the two timeouts, and replaces the session
    /// once it has outlasted the longer one.
    pub async fn handle(&self) -> Result<Arc<dyn Session>> {
        if !self.is_started() {
            return Err(CoordinationError::invalid_state("client is not started"));
        }

        if !self.is_connected() {
            self.check_timeouts().await?;
        }

        self.inner.holder.get_handle().await
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Wait until connected or until the connection timeout passes.
    pub async fn block_until_connected(&self) -> Result<bool> {
        let mut connected = self.inner.connected.subscribe();
        self.handle().await?;

        let waited = tokio::time::timeout(
            self.inner.connection_timeout,
            connected.wait_for(|connected| *connected),
        )
        .await;

        Ok(matches!(waited, Ok(Ok(_))))
    }

    /// Watch channel tracking the connected flag.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Receive every session event after the client has processed it.
    pub fn add_parent_watcher(&self, watcher: Arc<dyn Watcher>) {
        self.inner.parent_watchers.write().push(watcher);
    }

    /// Replace the session now.
    pub async fn reset(&self) -> Result<()> {
        let index = self.inner.instance_index.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(instance_index = index, "Resetting session handle");
        self.inner.connected.send_replace(false);
        *self.inner.connection_start.lock() = Instant::now();
        self.inner.holder.close_and_reset().await
    }

    /// Number of session instances this client has armed.
    pub fn instance_index(&self) -> u64 {
        self.inner.instance_index.load(Ordering::Acquire)
    }

    /// Connection string bound to the live session, if any.
    pub fn connection_string(&self) -> Option<String> {
        self.inner.holder.connection_string()
    }

    pub fn handle_state(&self) -> HandleState {
        self.inner.holder.state()
    }

    pub fn ensemble_provider(&self) -> &Arc<dyn EnsembleProvider> {
        &self.inner.ensemble_provider
    }

    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        self.inner.retry_policy.read().clone()
    }

    pub fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        *self.inner.retry_policy.write() = policy;
    }

    pub fn session_timeout(&self) -> Duration {
        self.inner.session_timeout
    }

    pub fn connection_timeout(&self) -> Duration {
        self.inner.connection_timeout
    }

    /// Whether a teardown swallowed an interruption since the last call.
    pub fn take_interrupted(&self) -> bool {
        self.inner.holder.take_interrupted()
    }

    async fn check_timeouts(&self) -> Result<()> {
        let session_timeout = self.inner.session_timeout;
        let connection_timeout = self.inner.connection_timeout;
        let elapsed = self.inner.connection_start.lock().elapsed();

        if elapsed < session_timeout.min(connection_timeout) {
            return Ok(());
        }

        if elapsed > session_timeout.max(connection_timeout) {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                "Connection attempt outlasted the session timeout; starting a new session"
            );
            // the old session is as good as expired for anyone listening
            self.inner
                .notify_parents(WatchedEvent::state_change(KeeperState::Expired));
            self.reset().await
        } else {
            Err(CoordinationError::ConnectionLoss)
        }
    }
}

impl ClientInner {
    fn process_event(self: &Arc<Self>, event: WatchedEvent) {
        if event.event_type == EventType::None {
            match event.state {
                KeeperState::SyncConnected | KeeperState::ConnectedReadOnly => {
                    self.connected.send_replace(true);
                }
                KeeperState::Expired => {
                    warn!("Session expired; a new session will be created");
                    self.mark_disconnected();
                    self.spawn_reset();
                }
                KeeperState::Disconnected | KeeperState::AuthFailed | KeeperState::Closed => {
                    self.mark_disconnected();
                }
            }
        }

        self.notify_parents(event);
    }

    fn notify_parents(&self, event: WatchedEvent) {
        let watchers: Vec<_> = self.parent_watchers.read().clone();
        for watcher in watchers {
            watcher.process(event.clone());
        }
    }

    fn mark_disconnected(&self) {
        let was_connected = self.connected.send_replace(false);
        if was_connected {
            *self.connection_start.lock() = Instant::now();
        }
    }

    fn spawn_reset(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("No runtime available to replace the expired session");
            return;
        };

        let inner = self.clone();
        runtime.spawn(async move {
            if !inner.started.load(Ordering::Acquire) {
                return;
            }
            inner.instance_index.fetch_add(1, Ordering::AcqRel);
            *inner.connection_start.lock() = Instant::now();
            if let Err(e) = inner.holder.close_and_reset().await {
                error!(error = %e, "Failed to reset expired session");
            }
        });
    }
}

struct ConnectionWatcher {
    inner: Weak<ClientInner>,
}

impl Watcher for ConnectionWatcher {
    fn process(&self, event: WatchedEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.process_event(event);
        }
    }
}

struct HolderEnsembleListener {
    inner: Weak<ClientInner>,
}

#[async_trait]
impl EnsembleListener for HolderEnsembleListener {
    async fn ensemble_changed(&self, _provider: &dyn EnsembleProvider) -> Result<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.holder.on_ensemble_changed().await,
            None => Ok(()),
        }
    }
}
