//! # kv-connection
//!
//! Connection contract shared by the key-value client and its connection pool.
//!
//! The pool never embeds transport details. It talks to connections through
//! the [`Connection`] trait and builds new ones through a [`ConnectionFactory`]
//! that owns a fixed set of construction parameters.
//!
//! ## Features
//!
//! - Process affinity (`pid`) recorded at construction for fork detection
//! - Activity bookkeeping (`last_active_at`, in-flight request flag)
//! - Lazy TCP and Unix domain socket transports on tokio
//! - `redis://` / `unix://` URL parsing for construction parameters
//!
//! ## Example
//!
//! ```rust,ignore
//! use kv_connection::{ConnectionConfig, ConnectionFactory, KvConnectionFactory};
//!
//! let config = ConnectionConfig::from_url("redis://localhost:6379/1")?;
//! let factory = KvConnectionFactory::new(config);
//! assert_eq!(factory.description(), "Connection<host=localhost,port=6379,db=1>");
//!
//! let conn = factory.create().await?;
//! let reply = conn.request(b"*1\r\n$4\r\nPING\r\n").await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;

pub use config::{ConnectionConfig, Endpoint};
pub use connection::{Connection, ConnectionFactory, KvConnection, KvConnectionFactory};
pub use error::ConnectionError;
