//! The session capability consumed from the coordination service.
//!
//! A [`Session`] is one heartbeat-maintained session with an ensemble. The
//! wire protocol behind it is not part of this crate; anything that can
//! create, delete, list and watch nodes can be plugged in through a
//! [`HandleFactory`].

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Survives the creating session; name gets a sequence suffix.
    PersistentSequential,
    /// Removed when the creating session ends.
    Ephemeral,
    /// Removed when the creating session ends; name gets a sequence suffix.
    EphemeralSequential,
}

impl CreateMode {
    /// Whether the node is tied to its session.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    /// Whether the service appends a sequence number to the name.
    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Session state carried by watch events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeeperState {
    Disconnected,
    SyncConnected,
    ConnectedReadOnly,
    Expired,
    AuthFailed,
    Closed,
}

impl KeeperState {
    /// Whether operations can currently reach the ensemble.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::SyncConnected | Self::ConnectedReadOnly)
    }
}

/// What happened to the watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Pure session state change.
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// A watch or session-state notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub state: KeeperState,
    pub path: Option<String>,
}

impl WatchedEvent {
    /// A session state change with no node attached.
    pub fn state_change(state: KeeperState) -> Self {
        Self {
            event_type: EventType::None,
            state,
            path: None,
        }
    }

    /// A node event observed while connected.
    pub fn node(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            state: KeeperState::SyncConnected,
            path: Some(path.into()),
        }
    }
}

/// Receives watch and session-state notifications.
///
/// Called from the session's event context, never from the caller's task.
/// Implementations must not block.
pub trait Watcher: Send + Sync {
    fn process(&self, event: WatchedEvent);
}

/// Watcher that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatcher;

impl Watcher for NoopWatcher {
    fn process(&self, _event: WatchedEvent) {}
}

/// Adapts a closure into a [`Watcher`].
pub struct FnWatcher<F>(F);

impl<F> FnWatcher<F>
where
    F: Fn(WatchedEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }

    /// Boxed into the shared form sessions take.
    pub fn shared(f: F) -> Arc<dyn Watcher> {
        Arc::new(Self(f))
    }
}

impl<F> Watcher for FnWatcher<F>
where
    F: Fn(WatchedEvent) + Send + Sync + 'static,
{
    fn process(&self, event: WatchedEvent) {
        (self.0)(event)
    }
}

impl<F> fmt::Debug for FnWatcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnWatcher")
    }
}

/// One session with the coordination service.
#[async_trait]
pub trait Session: Send + Sync {
    /// Identity assigned by the service, `None` until first connect.
    fn session_id(&self) -> Option<i64>;

    /// Create a node, returning its actual path (with any sequence suffix).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Delete a node.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check existence, optionally leaving a watch on the path.
    async fn exists(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<bool>;

    /// Read node data, optionally leaving a data watch.
    async fn get_data(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Vec<u8>>;

    /// Replace node data.
    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()>;

    /// List child names, optionally leaving a children watch.
    async fn get_children(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Vec<String>>;

    /// Replace the default watcher that receives session events.
    fn register(&self, watcher: Arc<dyn Watcher>);

    /// Renegotiate ensemble membership without dropping the session.
    async fn update_server_list(&self, connection_string: &str) -> Result<()>;

    /// Close the session.
    async fn close(&self) -> Result<()>;
}

/// Opens new sessions.
#[async_trait]
pub trait HandleFactory: Send + Sync {
    async fn new_handle(
        &self,
        connection_string: &str,
        session_timeout: Duration,
        watcher: Arc<dyn Watcher>,
        can_be_read_only: bool,
    ) -> Result<Arc<dyn Session>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_create_mode_flags() {
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(CreateMode::PersistentSequential.is_sequential());
        assert!(!CreateMode::Ephemeral.is_sequential());
    }

    #[test]
    fn test_fn_watcher() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let watcher = FnWatcher::shared(move |event| {
            if event.event_type == EventType::NodeDeleted {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        watcher.process(WatchedEvent::node(EventType::NodeDeleted, "/a"));
        watcher.process(WatchedEvent::state_change(KeeperState::Disconnected));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
