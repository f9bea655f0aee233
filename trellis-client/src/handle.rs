//! Connection handle management.
//!
//! [`HandleHolder`] owns the single live [`Session`] of a client. Its slot
//! moves between three states:
//!
//! - `Cleared`: no handle.
//! - `Creating`: a reset happened; the handle is built by the first
//!   [`HandleHolder::get_handle`] call, exactly once, with the connection
//!   string read from the ensemble provider at that moment.
//! - `Ready`: the handle exists and is returned without further coordination.
//!
//! Every reset bumps a generation counter. Handles remember the generation
//! they were created in, which is how an ensemble update aimed at a handle
//! that has since been replaced is detected and rejected.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::ensemble::EnsembleProvider;
use crate::session::{HandleFactory, NoopWatcher, Session, Watcher};
use crate::{CoordinationError, Result};

/// A created handle together with the connection string it is bound to.
pub struct LiveHandle {
    generation: u64,
    session: Arc<dyn Session>,
    connection_string: Mutex<String>,
    update_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl LiveHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn connection_string(&self) -> String {
        self.connection_string.lock().clone()
    }
}

struct PendingHandle {
    generation: u64,
    cell: OnceCell<Arc<LiveHandle>>,
}

enum HandleSlot {
    Cleared,
    Creating(Arc<PendingHandle>),
    Ready(Arc<LiveHandle>),
}

impl HandleSlot {
    /// The created handle, if any, regardless of whether the slot has been
    /// promoted to `Ready` yet.
    fn live(&self) -> Option<Arc<LiveHandle>> {
        match self {
            HandleSlot::Cleared => None,
            HandleSlot::Creating(pending) => pending.cell.get().cloned(),
            HandleSlot::Ready(live) => Some(live.clone()),
        }
    }
}

/// Observable state of a [`HandleHolder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Cleared,
    Resetting,
    Connected,
}

/// Owns creation, hand-off and teardown of the session handle.
pub struct HandleHolder {
    factory: Arc<dyn HandleFactory>,
    watcher: Arc<dyn Watcher>,
    ensemble_provider: Arc<dyn EnsembleProvider>,
    session_timeout: Duration,
    can_be_read_only: bool,
    slot: RwLock<HandleSlot>,
    generation: AtomicU64,
    // held across teardown so a new handle is never built before the old one is closed
    transition: tokio::sync::Mutex<()>,
    interrupted: AtomicBool,
}

impl HandleHolder {
    pub fn new(
        factory: Arc<dyn HandleFactory>,
        watcher: Arc<dyn Watcher>,
        ensemble_provider: Arc<dyn EnsembleProvider>,
        session_timeout: Duration,
        can_be_read_only: bool,
    ) -> Self {
        Self {
            factory,
            watcher,
            ensemble_provider,
            session_timeout,
            can_be_read_only,
            slot: RwLock::new(HandleSlot::Cleared),
            generation: AtomicU64::new(0),
            transition: tokio::sync::Mutex::new(()),
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> HandleState {
        match &*self.slot.read() {
            HandleSlot::Cleared => HandleState::Cleared,
            HandleSlot::Creating(pending) if pending.cell.get().is_none() => {
                HandleState::Resetting
            }
            _ => HandleState::Connected,
        }
    }

    /// Current reset generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Return the current handle, creating it if a reset is pending.
    ///
    /// Concurrent callers during creation wait for it and all observe the
    /// same instance.
    pub async fn get_handle(&self) -> Result<Arc<dyn Session>> {
        loop {
            let pending = match &*self.slot.read() {
                HandleSlot::Ready(live) => return Ok(live.session.clone()),
                HandleSlot::Creating(pending) => pending.clone(),
                HandleSlot::Cleared => {
                    return Err(CoordinationError::invalid_state(
                        "no session handle: holder is cleared",
                    ));
                }
            };

            let live = match pending
                .cell
                .get_or_try_init(|| self.create_handle(pending.generation))
                .await
            {
                Ok(live) => live.clone(),
                Err(_) if self.generation() != pending.generation => continue,
                Err(e) => return Err(e),
            };

            let promoted = {
                let mut slot = self.slot.write();
                let still_pending = matches!(
                    &*slot,
                    HandleSlot::Creating(current) if Arc::ptr_eq(current, &pending)
                );
                if still_pending {
                    *slot = HandleSlot::Ready(live.clone());
                    true
                } else {
                    matches!(&*slot, HandleSlot::Ready(current) if Arc::ptr_eq(current, &live))
                }
            };

            if promoted {
                return Ok(live.session.clone());
            }

            // a reset raced with creation; the orphan must not outlive it
            debug!(
                generation = live.generation,
                "Discarding handle created for a superseded reset"
            );
            self.close_live(&live).await?;
        }
    }

    /// Connection string bound to the active handle, `None` if none exists yet.
    pub fn connection_string(&self) -> Option<String> {
        self.slot.read().live().map(|live| live.connection_string())
    }

    /// The active handle with its generation, if one has been created.
    pub fn live_handle(&self) -> Option<Arc<LiveHandle>> {
        self.slot.read().live()
    }

    /// Propagate the provider's current connection string to the live handle.
    ///
    /// No-op when no handle exists yet; the eventual creation reads the
    /// latest string itself.
    pub async fn on_ensemble_changed(&self) -> Result<()> {
        match self.live_handle() {
            Some(live) => {
                let connection_string = self.ensemble_provider.connection_string();
                self.update_connection_string(&live, &connection_string)
                    .await
            }
            None => {
                debug!("Ensemble changed before a handle exists; nothing to update");
                Ok(())
            }
        }
    }

    /// Forward a new server list to `live`.
    ///
    /// Fails with `InvalidState` when `live` is no longer the holder's
    /// current handle.
    pub async fn update_connection_string(
        &self,
        live: &LiveHandle,
        connection_string: &str,
    ) -> Result<()> {
        let _update = live.update_lock.lock().await;

        if live.generation != self.generation() || live.closed.load(Ordering::Acquire) {
            warn!(
                handle_generation = live.generation,
                current_generation = self.generation(),
                "Rejected connection string update for a stale handle"
            );
            return Err(CoordinationError::invalid_state(
                "connection string update routed to a stale handle",
            ));
        }

        live.session.update_server_list(connection_string).await?;
        *live.connection_string.lock() = connection_string.to_string();
        info!(connection_string, "Updated server list of live session");
        Ok(())
    }

    /// Close the current handle, if any, and leave the holder cleared.
    /// Idempotent.
    pub async fn close_and_clear(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let previous = std::mem::replace(&mut *self.slot.write(), HandleSlot::Cleared);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.close_slot(previous).await
    }

    /// Close the current handle, if any, and arrange for a fresh one to be
    /// created on next use.
    pub async fn close_and_reset(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let pending = Arc::new(PendingHandle {
            generation,
            cell: OnceCell::new(),
        });
        let previous = std::mem::replace(&mut *self.slot.write(), HandleSlot::Creating(pending));
        debug!(generation, "Session handle reset");
        self.close_slot(previous).await
    }

    /// Whether a teardown swallowed an interruption since the last call.
    pub fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    async fn create_handle(&self, generation: u64) -> Result<Arc<LiveHandle>> {
        let _transition = self.transition.lock().await;
        if self.generation() != generation {
            return Err(CoordinationError::invalid_state(
                "session handle was reset before it could be created",
            ));
        }

        let connection_string = self.ensemble_provider.connection_string();
        let session = self
            .factory
            .new_handle(
                &connection_string,
                self.session_timeout,
                self.watcher.clone(),
                self.can_be_read_only,
            )
            .await?;

        info!(
            generation,
            connection_string = %connection_string,
            session_timeout_ms = self.session_timeout.as_millis() as u64,
            "Created session handle"
        );

        Ok(Arc::new(LiveHandle {
            generation,
            session,
            connection_string: Mutex::new(connection_string),
            update_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close_slot(&self, slot: HandleSlot) -> Result<()> {
        match slot.live() {
            Some(live) => self.close_live(&live).await,
            None => Ok(()),
        }
    }

    async fn close_live(&self, live: &LiveHandle) -> Result<()> {
        // an update already past its staleness check finishes first
        let _update = live.update_lock.lock().await;
        if live.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // stop event delivery before the close so nothing reaches the real watcher
        live.session.register(Arc::new(NoopWatcher));

        match live.session.close().await {
            Ok(()) => {
                info!(generation = live.generation, "Closed session handle");
                Ok(())
            }
            Err(CoordinationError::Interrupted) => {
                warn!(
                    generation = live.generation,
                    "Interrupted while closing session handle"
                );
                self.interrupted.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
