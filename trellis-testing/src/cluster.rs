//! In-memory coordination ensemble.
//!
//! [`TestingCluster`] stands in for a real ensemble in tests. It implements
//! [`HandleFactory`], so clients connect to it exactly as they would to a
//! wire-protocol backend, and it can be driven into the failure modes clients
//! have to survive: quorum loss, session expiry and ensemble replacement.
//!
//! Sessions are reachable while the cluster is running and their connect
//! string names at least one of the cluster's current endpoints. A session
//! that stays unreachable for longer than its timeout while the cluster is
//! running is expired by the server, and learns about it once it can reach
//! the ensemble again.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

use trellis_client::{
    ConnectionString, CoordinationError, CreateMode, HandleFactory, KeeperState, NoopWatcher,
    Result, Session, WatchedEvent, Watcher,
};

use crate::tree::{Change, DataTree, Watches};

static NEXT_PORT: AtomicU16 = AtomicU16::new(21810);

const REAP_INTERVAL: Duration = Duration::from_millis(20);

enum Delivery {
    Session(WatchedEvent),
    Watch(Arc<dyn Watcher>, WatchedEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Connected,
    Disconnected { since: Instant },
    Expired { notified: bool },
    /// Closed by a client that could not reach the ensemble; the server
    /// still holds it until it times out.
    Abandoned { since: Instant },
}

struct SessionEntry {
    connect_string: ConnectionString,
    timeout: Duration,
    status: Status,
    events: Option<mpsc::UnboundedSender<Delivery>>,
}

impl SessionEntry {
    fn send(&self, delivery: Delivery) {
        if let Some(events) = &self.events {
            let _ = events.send(delivery);
        }
    }
}

struct ClusterState {
    running: bool,
    endpoints: Vec<String>,
    tree: DataTree,
    watches: Watches,
    sessions: HashMap<i64, SessionEntry>,
    /// Expired sessions whose owners have since closed them.
    expired: HashSet<i64>,
}

impl ClusterState {
    fn reachable(&self, connect_string: &ConnectionString) -> bool {
        self.running
            && connect_string
                .endpoints()
                .iter()
                .any(|endpoint| self.endpoints.contains(endpoint))
    }

    fn check(&self, session: i64) -> Result<()> {
        match self.sessions.get(&session).map(|entry| entry.status) {
            Some(Status::Connected) => Ok(()),
            Some(Status::Disconnected { .. }) => Err(CoordinationError::ConnectionLoss),
            Some(Status::Expired { .. }) => Err(CoordinationError::SessionExpired),
            None if self.expired.contains(&session) => Err(CoordinationError::SessionExpired),
            Some(Status::Abandoned { .. }) | None => Err(CoordinationError::Closed),
        }
    }

    fn apply(&mut self, change: Change) {
        for (session, watcher, event) in self.watches.trigger(&change) {
            if let Some(entry) = self.sessions.get(&session) {
                entry.send(Delivery::Watch(watcher, event));
            }
        }
    }

    fn drop_ephemerals(&mut self, session: i64) {
        for path in self.tree.ephemerals(session) {
            if let Ok(change) = self.tree.delete(&path) {
                self.apply(change);
            }
        }
        self.watches.remove_session(session);
    }

    fn expire(&mut self, session: i64) -> bool {
        let Some(entry) = self.sessions.get_mut(&session) else {
            return false;
        };
        if matches!(entry.status, Status::Expired { .. }) {
            return false;
        }
        entry.status = Status::Expired { notified: false };
        info!(session, "Session expired");
        self.drop_ephemerals(session);
        true
    }

    /// Bring every session in line with the current topology and clock.
    fn refresh(&mut self) {
        let now = Instant::now();
        let ids: Vec<i64> = self.sessions.keys().copied().collect();

        for id in ids {
            let Some(entry) = self.sessions.get(&id) else {
                continue;
            };
            let reachable = self.reachable(&entry.connect_string);
            let (timeout, status) = (entry.timeout, entry.status);

            match status {
                Status::Connected if !reachable => {
                    self.set_status(id, Status::Disconnected { since: now });
                    self.notify(id, KeeperState::Disconnected);
                }
                Status::Disconnected { since } => {
                    if self.running && now.duration_since(since) >= timeout {
                        self.expire(id);
                        if reachable {
                            self.set_status(id, Status::Expired { notified: true });
                            self.notify(id, KeeperState::Expired);
                        }
                    } else if reachable {
                        self.set_status(id, Status::Connected);
                        self.notify(id, KeeperState::SyncConnected);
                    }
                }
                Status::Expired { notified: false } if reachable => {
                    self.set_status(id, Status::Expired { notified: true });
                    self.notify(id, KeeperState::Expired);
                }
                Status::Abandoned { since }
                    if self.running && now.duration_since(since) >= timeout =>
                {
                    debug!(session = id, "Reaping abandoned session");
                    self.sessions.remove(&id);
                    self.drop_ephemerals(id);
                }
                _ => {}
            }
        }
    }

    fn set_status(&mut self, session: i64, status: Status) {
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.status = status;
        }
    }

    fn notify(&self, session: i64, state: KeeperState) {
        if let Some(entry) = self.sessions.get(&session) {
            entry.send(Delivery::Session(WatchedEvent::state_change(state)));
        }
    }
}

struct ClusterInner {
    state: Mutex<ClusterState>,
    next_session_id: AtomicI64,
    sessions_created: AtomicUsize,
    reaper_started: AtomicBool,
    shutdown: AtomicBool,
}

impl ClusterInner {
    fn with_state<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> T {
        let mut state = self.state.lock();
        state.refresh();
        let result = f(&mut state);
        state.refresh();
        result
    }
}

/// In-memory ensemble of `size` endpoints.
#[derive(Clone)]
pub struct TestingCluster {
    inner: Arc<ClusterInner>,
}

impl TestingCluster {
    /// Create a running cluster.
    pub fn new(size: usize) -> Self {
        let inner = ClusterInner {
            state: Mutex::new(ClusterState {
                running: true,
                endpoints: allocate_endpoints(size),
                tree: DataTree::new(),
                watches: Watches::default(),
                sessions: HashMap::new(),
                expired: HashSet::new(),
            }),
            next_session_id: AtomicI64::new(0x1000),
            sessions_created: AtomicUsize::new(0),
            reaper_started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Comma-separated endpoints of the current ensemble.
    pub fn connect_string(&self) -> String {
        self.inner.state.lock().endpoints.join(",")
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Lose quorum. Every connected session is disconnected.
    pub fn stop(&self) {
        info!("Stopping testing cluster");
        self.inner.with_state(|state| state.running = false);
    }

    /// Restore quorum.
    pub fn start(&self) {
        info!("Starting testing cluster");
        self.inner.with_state(|state| state.running = true);
    }

    /// Swap in a brand new set of endpoints, as if the ensemble had been
    /// rebuilt elsewhere. The new ensemble knows none of the old sessions:
    /// their ephemeral nodes are gone and they observe expiry as soon as
    /// they reach it. Persistent nodes carry over.
    pub fn replace_endpoints(&self) -> String {
        self.inner.with_state(|state| {
            let size = state.endpoints.len();
            state.endpoints = allocate_endpoints(size);

            for change in state.tree.clear_ephemerals() {
                state.apply(change);
            }

            let ids: Vec<i64> = state.sessions.keys().copied().collect();
            for id in ids {
                let Some(status) = state.sessions.get(&id).map(|entry| entry.status) else {
                    continue;
                };
                match status {
                    Status::Connected => {
                        state.set_status(id, Status::Expired { notified: false });
                        state.notify(id, KeeperState::Disconnected);
                    }
                    Status::Disconnected { .. } => {
                        state.set_status(id, Status::Expired { notified: false });
                    }
                    Status::Abandoned { .. } => {
                        state.sessions.remove(&id);
                    }
                    Status::Expired { .. } => {}
                }
                state.watches.remove_session(id);
            }

            let connect_string = state.endpoints.join(",");
            info!(connect_string = %connect_string, "Replaced ensemble endpoints");
            connect_string
        })
    }

    /// Expire one session as the server would after a missed timeout.
    pub fn expire_session(&self, session: i64) -> bool {
        self.inner.with_state(|state| state.expire(session))
    }

    pub fn expire_all_sessions(&self) -> usize {
        self.inner.with_state(|state| {
            let ids: Vec<i64> = state.sessions.keys().copied().collect();
            ids.into_iter().filter(|id| state.expire(*id)).count()
        })
    }

    /// Number of sessions ever opened against this cluster.
    pub fn sessions_created(&self) -> usize {
        self.inner.sessions_created.load(Ordering::Acquire)
    }

    /// Number of sessions currently connected.
    pub fn live_sessions(&self) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .values()
            .filter(|entry| entry.status == Status::Connected)
            .count()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.inner.state.lock().tree.exists(path).unwrap_or(false)
    }

    /// Child names of `path`, empty if it does not exist.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.inner.state.lock().tree.children(path).unwrap_or_default()
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.state.lock().tree.data(path).ok()
    }

    /// Shut the cluster down for good.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.stop();
    }

    fn ensure_reaper(&self) {
        if self.inner.reaper_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak: Weak<ClusterInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                inner.state.lock().refresh();
            }
        });
    }
}

impl Default for TestingCluster {
    fn default() -> Self {
        Self::new(3)
    }
}

fn allocate_endpoints(size: usize) -> Vec<String> {
    (0..size.max(1))
        .map(|_| format!("127.0.0.1:{}", NEXT_PORT.fetch_add(1, Ordering::Relaxed)))
        .collect()
}

#[async_trait]
impl HandleFactory for TestingCluster {
    async fn new_handle(
        &self,
        connection_string: &str,
        session_timeout: Duration,
        watcher: Arc<dyn Watcher>,
        _can_be_read_only: bool,
    ) -> Result<Arc<dyn Session>> {
        self.ensure_reaper();

        let id = self.inner.next_session_id.fetch_add(1, Ordering::AcqRel);
        self.inner.sessions_created.fetch_add(1, Ordering::AcqRel);

        let default_watcher = Arc::new(RwLock::new(watcher));
        let (events, mut receiver) = mpsc::unbounded_channel::<Delivery>();

        let dispatch_watcher = default_watcher.clone();
        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                match delivery {
                    Delivery::Session(event) => {
                        let watcher = dispatch_watcher.read().clone();
                        watcher.process(event);
                    }
                    Delivery::Watch(watcher, event) => watcher.process(event),
                }
            }
        });

        self.inner.with_state(|state| {
            state.sessions.insert(
                id,
                SessionEntry {
                    connect_string: ConnectionString::parse(connection_string),
                    timeout: session_timeout,
                    // refresh() promotes it once reachable
                    status: Status::Disconnected {
                        since: Instant::now(),
                    },
                    events: Some(events),
                },
            );
        });

        debug!(session = id, connection_string, "Opened testing session");

        Ok(Arc::new(ClusterSession {
            id,
            cluster: self.inner.clone(),
            default_watcher,
        }))
    }
}

/// A session opened against a [`TestingCluster`].
pub struct ClusterSession {
    id: i64,
    cluster: Arc<ClusterInner>,
    default_watcher: Arc<RwLock<Arc<dyn Watcher>>>,
}

impl ClusterSession {
    fn op<T>(&self, f: impl FnOnce(&mut ClusterState) -> Result<T>) -> Result<T> {
        self.cluster.with_state(|state| {
            state.check(self.id)?;
            f(state)
        })
    }
}

#[async_trait]
impl Session for ClusterSession {
    fn session_id(&self) -> Option<i64> {
        Some(self.id)
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.op(|state| {
            let (actual, change) = state.tree.create(path, data, mode, self.id)?;
            state.apply(change);
            Ok(actual)
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.op(|state| {
            let change = state.tree.delete(path)?;
            state.apply(change);
            Ok(())
        })
    }

    async fn exists(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<bool> {
        self.op(|state| {
            let exists = state.tree.exists(path)?;
            if let Some(watcher) = watcher {
                state.watches.add_data(path, self.id, watcher);
            }
            Ok(exists)
        })
    }

    async fn get_data(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Vec<u8>> {
        self.op(|state| {
            let data = state.tree.data(path)?;
            if let Some(watcher) = watcher {
                state.watches.add_data(path, self.id, watcher);
            }
            Ok(data)
        })
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        self.op(|state| {
            let change = state.tree.set_data(path, data)?;
            state.apply(change);
            Ok(())
        })
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<Vec<String>> {
        self.op(|state| {
            let children = state.tree.children(path)?;
            if let Some(watcher) = watcher {
                state.watches.add_children(path, self.id, watcher);
            }
            Ok(children)
        })
    }

    fn register(&self, watcher: Arc<dyn Watcher>) {
        *self.default_watcher.write() = watcher;
    }

    async fn update_server_list(&self, connection_string: &str) -> Result<()> {
        self.cluster.with_state(|state| match state.sessions.get_mut(&self.id) {
            Some(entry) => {
                entry.connect_string = ConnectionString::parse(connection_string);
                Ok(())
            }
            None => Err(CoordinationError::Closed),
        })
    }

    async fn close(&self) -> Result<()> {
        self.cluster.with_state(|state| {
            let Some(status) = state.sessions.get(&self.id).map(|entry| entry.status) else {
                return;
            };
            match status {
                Status::Connected => {
                    state.sessions.remove(&self.id);
                    state.drop_ephemerals(self.id);
                }
                Status::Disconnected { since } => {
                    if let Some(entry) = state.sessions.get_mut(&self.id) {
                        entry.status = Status::Abandoned { since };
                        entry.events = None;
                    }
                    state.watches.remove_session(self.id);
                }
                Status::Expired { .. } => {
                    state.sessions.remove(&self.id);
                    state.expired.insert(self.id);
                }
                Status::Abandoned { .. } => {
                    state.sessions.remove(&self.id);
                }
            }
        });
        *self.default_watcher.write() = Arc::new(NoopWatcher);
        debug!(session = self.id, "Closed testing session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use trellis_client::{EventType, FnWatcher};

    fn recorder() -> (Arc<dyn Watcher>, Arc<SyncMutex<Vec<WatchedEvent>>>) {
        let events = Arc::new(SyncMutex::new(Vec::new()));
        let sink = events.clone();
        let watcher = FnWatcher::shared(move |event| sink.lock().push(event));
        (watcher, events)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn states(events: &SyncMutex<Vec<WatchedEvent>>) -> Vec<KeeperState> {
        events
            .lock()
            .iter()
            .filter(|event| event.event_type == EventType::None)
            .map(|event| event.state)
            .collect()
    }

    #[tokio::test]
    async fn test_session_connects_and_operates() {
        let cluster = TestingCluster::new(3);
        let (watcher, events) = recorder();
        let session = cluster
            .new_handle(&cluster.connect_string(), Duration::from_secs(1), watcher, false)
            .await
            .unwrap();

        session.create("/a", b"1", CreateMode::Persistent).await.unwrap();
        assert_eq!(session.get_data("/a", None).await.unwrap(), b"1");
        assert!(cluster.exists("/a"));
        assert_eq!(cluster.live_sessions(), 1);

        settle().await;
        assert_eq!(states(&events), vec![KeeperState::SyncConnected]);
    }

    #[tokio::test]
    async fn test_stop_disconnects_and_start_reconnects() {
        let cluster = TestingCluster::new(3);
        let (watcher, events) = recorder();
        let session = cluster
            .new_handle(&cluster.connect_string(), Duration::from_secs(5), watcher, false)
            .await
            .unwrap();

        cluster.stop();
        assert_eq!(
            session.exists("/", None).await.err(),
            Some(CoordinationError::ConnectionLoss)
        );

        cluster.start();
        assert!(session.exists("/", None).await.unwrap());

        settle().await;
        assert_eq!(
            states(&events),
            vec![
                KeeperState::SyncConnected,
                KeeperState::Disconnected,
                KeeperState::SyncConnected
            ]
        );
    }

    #[tokio::test]
    async fn test_long_outage_expires_session_and_its_ephemerals() {
        let cluster = TestingCluster::new(3);
        let (watcher, events) = recorder();
        let session = cluster
            .new_handle(&cluster.connect_string(), Duration::from_millis(100), watcher, false)
            .await
            .unwrap();
        session.create("/e", b"", CreateMode::Ephemeral).await.unwrap();

        cluster.stop();
        tokio::time::sleep(Duration::from_millis(150)).await;
        cluster.start();

        assert!(!cluster.exists("/e"));
        assert_eq!(
            session.exists("/", None).await.err(),
            Some(CoordinationError::SessionExpired)
        );

        settle().await;
        assert_eq!(states(&events).last(), Some(&KeeperState::Expired));
    }

    #[tokio::test]
    async fn test_watches_fire_once_through_dispatcher() {
        let cluster = TestingCluster::new(1);
        let session = cluster
            .new_handle(
                &cluster.connect_string(),
                Duration::from_secs(1),
                Arc::new(NoopWatcher),
                false,
            )
            .await
            .unwrap();
        let (watcher, events) = recorder();

        session.create("/p", b"", CreateMode::Persistent).await.unwrap();
        session.get_children("/p", Some(watcher)).await.unwrap();
        session.create("/p/a", b"", CreateMode::Persistent).await.unwrap();
        session.create("/p/b", b"", CreateMode::Persistent).await.unwrap();

        settle().await;
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::NodeChildrenChanged);
        assert_eq!(events[0].path.as_deref(), Some("/p"));
    }

    #[tokio::test]
    async fn test_close_removes_ephemerals_and_wakes_watchers() {
        let cluster = TestingCluster::new(1);
        let connect_string = cluster.connect_string();
        let owner = cluster
            .new_handle(&connect_string, Duration::from_secs(1), Arc::new(NoopWatcher), false)
            .await
            .unwrap();
        let observer = cluster
            .new_handle(&connect_string, Duration::from_secs(1), Arc::new(NoopWatcher), false)
            .await
            .unwrap();
        let (watcher, events) = recorder();

        owner.create("/e", b"", CreateMode::Ephemeral).await.unwrap();
        observer.exists("/e", Some(watcher)).await.unwrap();
        owner.close().await.unwrap();

        assert!(!cluster.exists("/e"));
        assert_eq!(
            owner.exists("/", None).await.err(),
            Some(CoordinationError::Closed)
        );

        settle().await;
        assert_eq!(events.lock()[0].event_type, EventType::NodeDeleted);
    }

    #[tokio::test]
    async fn test_replace_endpoints_requires_new_connect_string() {
        let cluster = TestingCluster::new(3);
        let old = cluster.connect_string();
        let (watcher, events) = recorder();
        let session = cluster
            .new_handle(&old, Duration::from_secs(1), watcher, false)
            .await
            .unwrap();
        session.create("/keep", b"", CreateMode::Persistent).await.unwrap();

        let new = cluster.replace_endpoints();
        assert_ne!(old, new);
        assert_eq!(
            session.exists("/", None).await.err(),
            Some(CoordinationError::SessionExpired)
        );

        session.update_server_list(&new).await.unwrap();
        settle().await;
        assert_eq!(states(&events).last(), Some(&KeeperState::Expired));

        let fresh = cluster
            .new_handle(&new, Duration::from_secs(1), Arc::new(NoopWatcher), false)
            .await
            .unwrap();
        assert!(fresh.exists("/keep", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_expire_session() {
        let cluster = TestingCluster::new(1);
        let (watcher, events) = recorder();
        let session = cluster
            .new_handle(&cluster.connect_string(), Duration::from_secs(1), watcher, false)
            .await
            .unwrap();
        let id = session.session_id().unwrap();

        assert!(cluster.expire_session(id));
        assert!(!cluster.expire_session(id));
        assert_eq!(cluster.sessions_created(), 1);
        assert_eq!(cluster.live_sessions(), 0);

        settle().await;
        assert_eq!(states(&events).last(), Some(&KeeperState::Expired));
    }
}
