//! Testing utilities for Trellis.
//!
//! ## Features
//!
//! - **TestingCluster** - In-memory ensemble with ephemeral and sequential nodes
//! - **Failure Injection** - Quorum loss, session expiry, ensemble replacement
//! - **FaultyCluster** - Applied requests whose replies are lost
//! - **Timing** - Scalable time budgets for asynchronous assertions
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use trellis_client::{CreateMode, HandleFactory, NoopWatcher};
//! use trellis_testing::TestingCluster;
//!
//! # tokio_test::block_on(async {
//! let cluster = TestingCluster::new(3);
//! let session = cluster
//!     .new_handle(&cluster.connect_string(), Duration::from_secs(1), Arc::new(NoopWatcher), false)
//!     .await
//!     .unwrap();
//!
//! session.create("/app", b"", CreateMode::Persistent).await.unwrap();
//! assert!(cluster.exists("/app"));
//!
//! cluster.stop();
//! assert!(session.exists("/app", None).await.is_err());
//! # });
//! ```

pub mod cluster;
pub mod faults;
pub mod timing;
mod tree;

pub use cluster::{ClusterSession, TestingCluster};
pub use faults::FaultyCluster;
pub use timing::Timing;
