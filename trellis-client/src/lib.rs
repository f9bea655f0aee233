//! Session plumbing for Trellis
//!
//! This crate owns the connection to a coordination ensemble.
//!
//! ## Features
//!
//! - **Handle Management** - Exactly-once session creation after every reset
//! - **Ensemble Tracking** - Fixed and dynamic connection strings with listeners
//! - **Connection State** - Timeout checks and automatic session replacement
//! - **Retry Policies** - Exponential backoff for connection-level failures
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use trellis_client::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ClientConfig::builder()
//!         .connect_string("zk1:2181,zk2:2181,zk3:2181")
//!         .build();
//!
//!     // Any HandleFactory implementation (a wire client, or a test cluster)
//!     let client = CoordinationClient::from_config(&config, factory)?;
//!     client.start().await?;
//!
//!     let session = client.handle().await?;
//!     session.create("/app", b"", CreateMode::Persistent).await?;
//!
//!     client.close().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod handle;
pub mod retry;
pub mod session;

pub use client::CoordinationClient;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use ensemble::{
    ConnectionString, DynamicEnsembleProvider, EnsembleListener, EnsembleListeners,
    EnsembleProvider, FixedEnsembleProvider,
};
pub use error::{CoordinationError, Result};
pub use handle::{HandleHolder, HandleState, LiveHandle};
pub use retry::{
    ExponentialBackoffRetry, RetryNTimes, RetryPolicy, call_with_retry, call_with_session,
    retry_with,
};
pub use session::{
    CreateMode, EventType, FnWatcher, HandleFactory, KeeperState, NoopWatcher, Session,
    WatchedEvent, Watcher,
};
