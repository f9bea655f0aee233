//! Coordination framework for Trellis
//!
//! Builds on `trellis-client` with the pieces applications and recipes use
//! directly.
//!
//! ## Features
//!
//! - **Retried Operations** - Node operations retried on connection loss
//! - **Protected Creates** - Sequential nodes recovered after an ambiguous failure
//! - **Connection State** - Connected/Suspended/Reconnected/Lost transitions
//! - **Idle Supervisor** - A framework that closes itself when unused
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use trellis_client::CreateMode;
//! use trellis_framework::FrameworkBuilder;
//! use trellis_testing::TestingCluster;
//!
//! # tokio_test::block_on(async {
//! let cluster = TestingCluster::new(3);
//! let framework = FrameworkBuilder::new()
//!     .connect_string(cluster.connect_string())
//!     .handle_factory(Arc::new(cluster.clone()))
//!     .build()
//!     .unwrap();
//!
//! framework.start().await.unwrap();
//! framework
//!     .create_with_parents("/app/config", b"v1", CreateMode::Persistent)
//!     .await
//!     .unwrap();
//! assert_eq!(framework.get_data("/app/config").await.unwrap(), b"v1");
//! framework.close().await.unwrap();
//! # });
//! ```

pub mod builder;
pub mod framework;
pub mod paths;
pub mod state;
pub mod temp;

pub use builder::FrameworkBuilder;
pub use framework::{Framework, FrameworkState};
pub use state::{ConnectionState, ConnectionStateListener, ConnectionStateManager};
pub use temp::TempFramework;
