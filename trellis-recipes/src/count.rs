//! Lease limits.

use std::sync::Arc;
use tokio::sync::watch;

/// A count shared between semaphores in this process.
///
/// Changing it wakes every acquirer waiting on a semaphore that uses it.
#[derive(Clone)]
pub struct SharedCount {
    sender: Arc<watch::Sender<usize>>,
}

impl SharedCount {
    pub fn new(value: usize) -> Self {
        let (sender, _) = watch::channel(value);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn get(&self) -> usize {
        *self.sender.borrow()
    }

    pub fn set(&self, value: usize) {
        self.sender.send_replace(value);
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.sender.subscribe()
    }
}

impl std::fmt::Debug for SharedCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedCount").field(&self.get()).finish()
    }
}

/// How many leases a semaphore grants at once.
#[derive(Debug, Clone)]
pub enum MaxLeases {
    Fixed(usize),
    Shared(SharedCount),
}

impl MaxLeases {
    /// The limit right now.
    pub fn current(&self) -> usize {
        match self {
            Self::Fixed(n) => *n,
            Self::Shared(count) => count.get(),
        }
    }

    /// Change notifications, for limits that can change.
    pub fn subscribe(&self) -> Option<watch::Receiver<usize>> {
        match self {
            Self::Fixed(_) => None,
            Self::Shared(count) => Some(count.subscribe()),
        }
    }
}

impl From<usize> for MaxLeases {
    fn from(n: usize) -> Self {
        Self::Fixed(n)
    }
}

impl From<SharedCount> for MaxLeases {
    fn from(count: SharedCount) -> Self {
        Self::Shared(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed() {
        let max = MaxLeases::from(3);
        assert_eq!(max.current(), 3);
        assert!(max.subscribe().is_none());
    }

    #[tokio::test]
    async fn test_shared_count_notifies() {
        let count = SharedCount::new(1);
        let max = MaxLeases::from(count.clone());
        let mut changes = max.subscribe().unwrap();

        count.set(4);
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow(), 4);
        assert_eq!(max.current(), 4);
    }
}
