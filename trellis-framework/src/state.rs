//! Connection state as seen by framework users.

use parking_lot::{Mutex, RwLock};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use trellis_client::{EventType, KeeperState, WatchedEvent};

/// Connection state published to framework listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// First successful connection.
    Connected,
    /// Connection lost; the session may still be alive.
    Suspended,
    /// Connected again after a suspension or a lost session.
    Reconnected,
    /// The session is gone along with everything it owned.
    Lost,
    /// Connected to a partitioned ensemble that only serves reads.
    ReadOnly,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Reconnected | Self::ReadOnly)
    }
}

/// Callback form of a connection state listener.
pub type ConnectionStateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct Tracked {
    current: Option<ConnectionState>,
    has_connected: bool,
}

/// Turns session events into [`ConnectionState`] transitions.
pub struct ConnectionStateManager {
    sender: broadcast::Sender<ConnectionState>,
    tracked: Mutex<Tracked>,
    listeners: RwLock<Vec<ConnectionStateListener>>,
}

impl Default for ConnectionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            sender,
            tracked: Mutex::new(Tracked {
                current: None,
                has_connected: false,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Receive every published transition.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.sender.subscribe()
    }

    /// Register a callback for every published transition.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Last published state.
    pub fn current(&self) -> Option<ConnectionState> {
        self.tracked.lock().current
    }

    /// Map a session event and publish the resulting state, if any.
    pub fn process(&self, event: &WatchedEvent) -> Option<ConnectionState> {
        if event.event_type != EventType::None {
            return None;
        }

        let state = {
            let mut tracked = self.tracked.lock();
            let state = match event.state {
                KeeperState::SyncConnected if tracked.has_connected => ConnectionState::Reconnected,
                KeeperState::SyncConnected => ConnectionState::Connected,
                KeeperState::ConnectedReadOnly => ConnectionState::ReadOnly,
                KeeperState::Disconnected => ConnectionState::Suspended,
                KeeperState::Expired => ConnectionState::Lost,
                KeeperState::AuthFailed | KeeperState::Closed => return None,
            };
            if tracked.current == Some(state) {
                return None;
            }
            if state.is_connected() {
                tracked.has_connected = true;
            }
            tracked.current = Some(state);
            state
        };

        self.publish(state);
        Some(state)
    }

    fn publish(&self, state: ConnectionState) {
        info!(state = ?state, "Connection state changed");
        let _ = self.sender.send(state);

        let listeners: Vec<_> = self.listeners.read().clone();
        for (index, listener) in listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
                error!(listener = index, state = ?state, "Connection state listener panicked");
            }
        }
    }
}
