//! Distributed coordination recipes for Trellis
//!
//! ## Features
//!
//! - **Counting Semaphore** - At most N leases held across processes
//! - **FIFO Admission** - Leases granted in arrival order
//! - **Shared Limits** - Lease counts that change while waiters queue
//! - **Session Recovery** - Waiters re-queue after their session expires
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use trellis_framework::FrameworkBuilder;
//! use trellis_recipes::{DistributedLock, InterProcessSemaphore};
//! use trellis_testing::TestingCluster;
//!
//! # tokio_test::block_on(async {
//! let cluster = TestingCluster::new(3);
//! let framework = FrameworkBuilder::new()
//!     .connect_string(cluster.connect_string())
//!     .handle_factory(Arc::new(cluster.clone()))
//!     .build()
//!     .unwrap();
//! framework.start().await.unwrap();
//!
//! let semaphore = InterProcessSemaphore::new(framework.clone(), "/locks/jobs", 1);
//! let lease = semaphore.acquire().await.unwrap();
//! assert!(semaphore.try_acquire().await.unwrap().is_none());
//!
//! assert!(lease.release().await.unwrap());
//! framework.close().await.unwrap();
//! # });
//! ```

pub mod count;
pub mod error;
pub mod lease;
pub mod lock;
pub mod semaphore;

pub use count::{MaxLeases, SharedCount};
pub use error::{LockError, Result};
pub use lease::Lease;
pub use lock::DistributedLock;
pub use semaphore::InterProcessSemaphore;
