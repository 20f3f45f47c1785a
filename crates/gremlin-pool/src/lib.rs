//! # gremlin-driver-pool
//!
//! Connection pool for Gremlin servers with bounded reconnection.
//!
//! The pool keeps a fixed number of persistent connections to one server
//! endpoint and shares them between concurrent callers. Each connection
//! carries at most a configured number of in-flight requests.
//!
//! ## Features
//!
//! - Fixed slot count, filled eagerly at build time
//! - Least-loaded connection selection with atomic capacity reservation
//! - Immediate [`PoolError::PoolBusy`] rejection instead of queueing
//! - Single-flight reconnection per dead connection, with a bounded
//!   retry budget and configurable [`Backoff`]
//! - Lifecycle events via [`Pool::subscribe`]
//!
//! The wire protocol is not part of this crate. Connections are opened by
//! a [`ConnectionFactory`] supplied by the caller.
//!
//! ## Example
//!
//! ```rust,ignore
//! use gremlin_driver_pool::{Endpoint, Pool, PoolSettings};
//!
//! let mut settings = PoolSettings::new();
//! settings.set_pool_size(8)?;
//! settings.set_nr_reconnect_retries(2)?;
//!
//! let pool = Pool::builder(WebSocketFactory::default())
//!     .endpoint(Endpoint::new("graph.internal"))
//!     .settings(settings)
//!     .build()
//!     .await?;
//!
//! let conn = pool.get()?;
//! if let Err(e) = conn.submit(request).await {
//!     conn.fail().await?;
//! }
//! // Connection capacity is returned to the pool on drop
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod reconnect;
pub mod transport;

pub use config::{Backoff, Endpoint, PoolSettings};
pub use connection::{Connection, ConnectionState};
pub use error::{AcquireError, PoolError, TransportError};
pub use pool::{Pool, PoolBuilder, PoolEvent, PoolStatus, PooledConnection};
pub use reconnect::{ReconnectPolicy, ReconnectState};
pub use transport::{Channel, ConnectionFactory};
