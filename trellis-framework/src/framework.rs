//! The framework: a started client plus retried node operations.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use trellis_client::{
    CoordinationClient, CoordinationError, CreateMode, FnWatcher, Result, Session, Watcher,
    call_with_session,
};

use crate::paths;
use crate::state::{ConnectionState, ConnectionStateManager};

const ORPHAN_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Lifecycle of a [`Framework`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkState {
    Latent,
    Started,
    Stopped,
}

struct FrameworkInner {
    client: CoordinationClient,
    state: Mutex<FrameworkState>,
    connection_states: Arc<ConnectionStateManager>,
}

/// Coordination framework.
///
/// Every node operation runs against the client's current session and is
/// retried per the client's retry policy on connection-level failures.
#[derive(Clone)]
pub struct Framework {
    inner: Arc<FrameworkInner>,
}

impl Framework {
    /// Wrap a client that has not been started yet.
    pub fn new(client: CoordinationClient) -> Self {
        let connection_states = Arc::new(ConnectionStateManager::new());

        let states = connection_states.clone();
        client.add_parent_watcher(FnWatcher::shared(move |event| {
            states.process(&event);
        }));

        Self {
            inner: Arc::new(FrameworkInner {
                client,
                state: Mutex::new(FrameworkState::Latent),
                connection_states,
            }),
        }
    }

    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != FrameworkState::Latent {
                return Err(CoordinationError::invalid_state(
                    "framework cannot be started more than once",
                ));
            }
            *state = FrameworkState::Started;
        }

        info!("Starting framework");
        self.inner.client.start().await
    }

    /// Close the client. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), FrameworkState::Stopped);
        if previous != FrameworkState::Started {
            return Ok(());
        }

        info!("Closing framework");
        self.inner.client.close().await
    }

    pub fn state(&self) -> FrameworkState {
        *self.inner.state.lock()
    }

    pub fn is_started(&self) -> bool {
        self.state() == FrameworkState::Started
    }

    pub fn client(&self) -> &CoordinationClient {
        &self.inner.client
    }

    pub fn connection_states(&self) -> &Arc<ConnectionStateManager> {
        &self.inner.connection_states
    }

    /// Receive every connection state transition.
    pub fn subscribe_connection_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.connection_states.subscribe()
    }

    /// Callback for every connection state transition.
    pub fn add_connection_state_listener<F>(&self, listener: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.connection_states.add_listener(listener);
    }

    pub async fn block_until_connected(&self) -> Result<bool> {
        self.check_started()?;
        self.inner.client.block_until_connected().await
    }

    /// Create a node. Parents must exist.
    pub async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.retrying(move |session| async move { session.create(path, data, mode).await })
            .await
    }

    /// Create a node, creating missing parents as persistent nodes.
    pub async fn create_with_parents(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String> {
        self.retrying(move |session| async move {
            create_with_parents(session.as_ref(), path, data, mode).await
        })
        .await
    }

    /// Create a node whose name carries a fresh protection id.
    ///
    /// When an attempt fails after the ensemble may already have applied
    /// it, the parent is searched for a child with that id before trying
    /// again, so a retried create never leaves a duplicate behind. Missing
    /// parents are created.
    ///
    /// If the call fails or is cancelled, a background task searches for the
    /// node and deletes it, retrying until it succeeds or the session or
    /// framework is gone.
    pub async fn create_protected(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String> {
        let id = Uuid::new_v4();
        let (parent, name) = paths::split_path(path);
        let protected = paths::make_path(parent, &paths::protected_name(&id, name));
        let protected = protected.as_str();
        let retrying = AtomicBool::new(false);
        let retrying = &retrying;
        let mut orphan = OrphanCleanup {
            framework: Some(self.clone()),
            parent: parent.to_string(),
            id,
            mode,
        };

        let created = self
            .retrying(move |session| async move {
                if retrying.swap(true, Ordering::AcqRel)
                    && let Some(found) = find_protected(session.as_ref(), parent, &id).await?
                {
                    debug!(path = %found, "Recovered protected node after connection loss");
                    return Ok(found);
                }
                create_with_parents(session.as_ref(), protected, data, mode).await
            })
            .await;

        if created.is_ok() {
            orphan.disarm();
        }
        created
    }

    /// Find a node created by [`create_protected`](Self::create_protected)
    /// under `parent` with protection id `id`.
    pub async fn find_protected_node(&self, parent: &str, id: &Uuid) -> Result<Option<String>> {
        self.retrying(move |session| async move {
            find_protected(session.as_ref(), parent, id).await
        })
        .await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.retrying(move |session| async move { session.delete(path).await })
            .await
    }

    /// Delete a node, treating an already-missing node as success.
    pub async fn delete_if_exists(&self, path: &str) -> Result<bool> {
        self.retrying(move |session| async move {
            match session.delete(path).await {
                Ok(()) => Ok(true),
                Err(CoordinationError::NoNode(_)) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.exists_watched(path, None).await
    }

    pub async fn exists_watched(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<bool> {
        self.retrying(move |session| {
            let watcher = watcher.clone();
            async move { session.exists(path, watcher).await }
        })
        .await
    }

    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.get_data_watched(path, None).await
    }

    pub async fn get_data_watched(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Vec<u8>> {
        self.retrying(move |session| {
            let watcher = watcher.clone();
            async move { session.get_data(path, watcher).await }
        })
        .await
    }

    pub async fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        self.retrying(move |session| async move { session.set_data(path, data).await })
            .await
    }

    pub async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.get_children_watched(path, None).await
    }

    pub async fn get_children_watched(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Vec<String>> {
        self.retrying(move |session| {
            let watcher = watcher.clone();
            async move { session.get_children(path, watcher).await }
        })
        .await
    }

    /// Create `path` and any missing ancestors as empty persistent nodes.
    pub async fn ensure_path(&self, path: &str) -> Result<()> {
        self.retrying(move |session| async move { ensure_path(session.as_ref(), path).await })
            .await
    }

    async fn retrying<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(Arc<dyn Session>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check_started()?;
        call_with_session(&self.inner.client, op).await
    }

    fn check_started(&self) -> Result<()> {
        match self.state() {
            FrameworkState::Started => Ok(()),
            FrameworkState::Latent => Err(CoordinationError::invalid_state(
                "framework has not been started",
            )),
            FrameworkState::Stopped => Err(CoordinationError::invalid_state(
                "framework has been closed",
            )),
        }
    }
}

/// Deletes the node of a protected create that never returned a path.
struct OrphanCleanup {
    framework: Option<Framework>,
    parent: String,
    id: Uuid,
    mode: CreateMode,
}

impl OrphanCleanup {
    fn disarm(&mut self) {
        self.framework = None;
    }
}

impl Drop for OrphanCleanup {
    fn drop(&mut self) {
        let Some(framework) = self.framework.take() else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let parent = std::mem::take(&mut self.parent);
        runtime.spawn(remove_orphan(framework, parent, self.id, self.mode));
    }
}

async fn remove_orphan(framework: Framework, parent: String, id: Uuid, mode: CreateMode) {
    loop {
        let removed = match framework.find_protected_node(&parent, &id).await {
            Ok(Some(path)) => framework.delete_if_exists(&path).await,
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };
        match removed {
            Ok(true) => {
                debug!(%parent, %id, "Removed orphaned protected node");
                return;
            }
            Ok(false) => return,
            Err(e) if e.is_retryable() || (e.is_session_expired() && !mode.is_ephemeral()) => {
                debug!(%parent, %id, error = %e, "Retrying orphaned node removal");
                tokio::time::sleep(ORPHAN_RETRY_PAUSE).await;
            }
            // the node went with the session, or the framework is closed
            Err(CoordinationError::SessionExpired | CoordinationError::InvalidState(_)) => return,
            Err(e) => {
                warn!(%parent, %id, error = %e, "Could not remove orphaned protected node");
                return;
            }
        }
    }
}

async fn ensure_path(session: &dyn Session, path: &str) -> Result<()> {
    let mut targets = paths::ancestors(path);
    if path != "/" {
        targets.push(path.to_string());
    }

    for target in targets {
        match session.create(&target, b"", CreateMode::Persistent).await {
            Ok(_) | Err(CoordinationError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn create_with_parents(
    session: &dyn Session,
    path: &str,
    data: &[u8],
    mode: CreateMode,
) -> Result<String> {
    match session.create(path, data, mode).await {
        Err(CoordinationError::NoNode(_)) => {
            let (parent, _) = paths::split_path(path);
            ensure_path(session, parent).await?;
            session.create(path, data, mode).await
        }
        other => other,
    }
}

async fn find_protected(session: &dyn Session, parent: &str, id: &Uuid) -> Result<Option<String>> {
    let children = match session.get_children(parent, None).await {
        Ok(children) => children,
        Err(CoordinationError::NoNode(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    let id = id.to_string();
    Ok(children
        .into_iter()
        .find(|child| paths::protected_id(child) == Some(id.as_str()))
        .map(|child| paths::make_path(parent, &child)))
}
