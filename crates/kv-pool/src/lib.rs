//! # kv-pool
//!
//! Blocking connection pool for key-value clients.
//!
//! Many tasks borrow connections from one bounded pool. When every connection
//! is checked out and the pool is at capacity, borrowers wait (optionally with
//! a timeout) until one is returned.
//!
//! ## Features
//!
//! - Optional capacity ceiling enforced by a FIFO semaphore
//! - Acquisition timeout with no phantom permit reservations
//! - Reuse of the most recently released connection
//! - Background eviction of idle connections
//! - Fork safety: connections created by another process are never reused
//! - RAII [`PooledConnection`] guards alongside explicit `acquire`/`release`
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use kv_pool::Pool;
//!
//! let pool = Pool::from_url(
//!     "redis://localhost:6379/0?max_connections=20&timeout=5&max_idle_time=300&idle_check_interval=30",
//! )?;
//!
//! let conn = pool.get().await?;
//! let reply = conn.request(b"*1\r\n$4\r\nPING\r\n").await?;
//! // Connection automatically returned to pool on drop
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;
mod reaper;

pub use config::PoolConfig;
pub use error::PoolError;
pub use kv_connection::{Connection, ConnectionFactory};
pub use lifecycle::{ConnectionState, ProcessIdSource};
pub use pool::{Pool, PoolBuilder, PoolStatus, PooledConnection};
