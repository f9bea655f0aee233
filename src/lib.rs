// Trellis - a coordination-service client for Rust
//
// This library keeps a session to a ZooKeeper-style ensemble usable across
// connection loss, session expiry and ensemble changes, and builds
// distributed recipes on top of it.

// Re-export core functionality
pub use trellis_client::*;

// Re-export optional crates
#[cfg(feature = "framework")]
pub use trellis_framework;

#[cfg(feature = "recipes")]
pub use trellis_recipes;

#[cfg(feature = "testing")]
pub use trellis_testing;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        ClientConfig, CoordinationClient, CoordinationError, CreateMode, EnsembleProvider,
        ExponentialBackoffRetry, FixedEnsembleProvider, HandleFactory, KeeperState, RetryPolicy,
        Session, WatchedEvent, Watcher,
    };

    #[cfg(feature = "framework")]
    pub use trellis_framework::{ConnectionState, Framework, FrameworkBuilder, TempFramework};

    #[cfg(feature = "recipes")]
    pub use trellis_recipes::{
        DistributedLock, InterProcessSemaphore, Lease, LockError, MaxLeases, SharedCount,
    };

    #[cfg(feature = "testing")]
    pub use trellis_testing::{FaultyCluster, TestingCluster, Timing};
}
