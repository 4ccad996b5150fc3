//! # kv-testing
//!
//! Test infrastructure for the key-value connection pool.
//!
//! ## Features
//!
//! - In-memory connections and a scriptable factory for pool tests
//! - Mock TCP server for socket-level tests
//!
//! ## Mock Connection Example
//!
//! ```rust,ignore
//! use kv_testing::MockFactory;
//! use kv_pool::Pool;
//!
//! #[tokio::test]
//! async fn test_with_mock_connections() {
//!     let factory = MockFactory::with_params([("host", "localhost")]);
//!     let pool = Pool::builder(factory.clone()).max_connections(2).build().unwrap();
//!
//!     let conn = pool.acquire().await.unwrap();
//!     assert_eq!(conn.param("host"), Some("localhost"));
//!     assert_eq!(factory.created_count(), 1);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock_connection;
pub mod mock_server;

pub use mock_connection::{MockConnection, MockFactory};
pub use mock_server::{MockKvServer, MockReply, MockServerBuilder, MockServerConfig, MockServerError};
