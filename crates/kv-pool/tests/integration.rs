//! Connection pool integration tests over real sockets.
//!
//! Each test starts a `MockKvServer` on a loopback port and builds a
//! socket-backed pool for it with `Pool::from_url`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use kv_connection::Connection;
use kv_pool::{ConnectionState, Pool, PoolError};
use kv_testing::{MockKvServer, MockReply};

const PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";

async fn ping_server() -> MockKvServer {
    MockKvServer::builder()
        .with_response(PING, MockReply::data(b"+PONG\r\n".as_slice()))
        .build()
        .await
        .expect("Failed to start mock server")
}

/// Poll until the server sees `expected` open connections.
async fn wait_for_connections(server: &MockKvServer, expected: usize) {
    for _ in 0..200 {
        if server.connection_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.connection_count().await, expected);
}

// =============================================================================
// Basic Pool Tests
// =============================================================================

#[tokio::test]
async fn test_pool_from_url_and_close() {
    let server = ping_server().await;
    let pool = Pool::from_url(&format!("{}?max_connections=5&timeout=1", server.url(2)))
        .expect("Failed to create pool");

    assert!(!pool.is_closed());
    assert_eq!(
        pool.describe(),
        format!(
            "BlockingConnectionPool<Connection<host=127.0.0.1,port={},db=2>>",
            server.port()
        )
    );

    let status = pool.status();
    assert_eq!(status.max, Some(5));
    assert_eq!(status.in_use, 0);

    pool.close().await;
    assert!(pool.is_closed());
}

#[tokio::test]
async fn test_pool_get_connection() {
    let server = ping_server().await;
    let pool = Pool::from_url(&server.url(0)).expect("Failed to create pool");

    let conn = pool.get().await.expect("Failed to get connection");
    assert_eq!(pool.status().in_use, 1);
    assert_eq!(
        pool.connection_state(conn.connection()),
        ConnectionState::Unconnected
    );

    let reply = conn.request(PING).await.expect("Request failed");
    assert_eq!(reply.as_ref(), b"+PONG\r\n");
    assert_eq!(
        pool.connection_state(conn.connection()),
        ConnectionState::InUse
    );

    // Drop connection - should return to pool
    drop(conn);

    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 1);

    pool.close().await;
}

#[tokio::test]
async fn test_pool_connection_reuse() {
    let server = ping_server().await;
    let pool = Pool::from_url(&format!("{}?max_connections=2", server.url(0)))
        .expect("Failed to create pool");

    let conn1 = pool.get().await.expect("Failed to get connection 1");
    conn1.request(PING).await.expect("Request 1 failed");
    let first = Arc::clone(conn1.connection());
    drop(conn1);

    let conn2 = pool.get().await.expect("Failed to get connection 2");
    conn2.request(PING).await.expect("Request 2 failed");

    assert!(Arc::ptr_eq(&first, conn2.connection()));
    assert_eq!(server.accepted_count().await, 1, "socket should be reused");

    drop(conn2);
    pool.close().await;
}

#[tokio::test]
async fn test_connect_failure_surfaces_on_first_request() {
    // Reserve a port, then free it so nothing listens there.
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let pool = Pool::from_url(&format!("redis://127.0.0.1:{port}?connect_timeout=1"))
        .expect("Failed to create pool");

    let conn = pool.get().await.expect("connections open lazily");
    let err = conn.request(PING).await.unwrap_err();

    assert!(err.is_transient());
    assert!(!conn.is_connected());
}

// =============================================================================
// Concurrent Access Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_bounded_sockets() {
    let server = ping_server().await;
    let pool = Arc::new(
        Pool::from_url(&format!("{}?max_connections=2&timeout=5", server.url(0)))
            .expect("Failed to create pool"),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let conn = pool.get().await.expect("Failed to get connection");
            let reply = conn.request(PING).await.expect("Request failed");
            assert_eq!(reply.as_ref(), b"+PONG\r\n");
        }));
    }
    for handle in handles {
        handle.await.expect("Task panicked");
    }

    assert!(server.accepted_count().await <= 2);
    let status = pool.status();
    assert!(status.total <= 2);
    assert_eq!(status.in_use, 0);

    pool.close().await;
}

#[tokio::test]
async fn test_exhausted_pool_times_out() {
    let server = ping_server().await;
    let pool = Pool::from_url(&format!("{}?max_connections=1&timeout=0.1", server.url(0)))
        .expect("Failed to create pool");

    let _held = pool.get().await.expect("Failed to get connection");
    let err = pool.get().await.unwrap_err();

    assert!(matches!(err, PoolError::AcquisitionTimeout(_)));
    assert_eq!(err.to_string(), "No connection available.");
}

// =============================================================================
// Teardown Tests
// =============================================================================

#[tokio::test]
async fn test_idle_reaper_closes_socket() {
    let server = ping_server().await;
    let pool = Pool::from_url(&format!(
        "{}?max_idle_time=0.2&idle_check_interval=0.05",
        server.url(0)
    ))
    .expect("Failed to create pool");

    let conn = pool.get().await.expect("Failed to get connection");
    conn.request(PING).await.expect("Request failed");
    let handle = Arc::clone(conn.connection());
    drop(conn);
    assert_eq!(server.connection_count().await, 1);

    wait_for_connections(&server, 0).await;

    assert!(!handle.is_connected());
    assert_eq!(pool.status().total, 0);
    assert_eq!(
        pool.connection_state(&handle),
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_close_disconnects_sockets() {
    let server = ping_server().await;
    let pool = Pool::from_url(&format!("{}?max_connections=3", server.url(0)))
        .expect("Failed to create pool");

    let a = pool.get().await.expect("Failed to get connection a");
    let b = pool.get().await.expect("Failed to get connection b");
    a.request(PING).await.expect("Request a failed");
    b.request(PING).await.expect("Request b failed");
    drop(a);
    wait_for_connections(&server, 2).await;

    pool.close().await;

    wait_for_connections(&server, 0).await;
    assert!(!b.is_connected());
    assert!(matches!(pool.get().await, Err(PoolError::PoolClosed)));
}

#[tokio::test]
async fn test_close_interrupts_request_awaiting_reply() {
    let server = MockKvServer::builder()
        .with_default_reply(MockReply::Silent)
        .build()
        .await
        .expect("Failed to start mock server");
    let pool = Pool::from_url(&server.url(0)).expect("Failed to create pool");

    let conn = pool.get().await.expect("Failed to get connection");
    let handle = Arc::clone(conn.connection());
    let request = tokio::spawn({
        let handle = Arc::clone(&handle);
        async move { handle.request(PING).await }
    });
    for _ in 0..200 {
        if handle.is_awaiting_response() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(handle.is_awaiting_response());

    tokio::time::timeout(Duration::from_secs(2), pool.close())
        .await
        .expect("close must not wait for the unanswered reply");

    let result = request.await.expect("Task panicked");
    assert!(result.is_err());
    assert!(!handle.is_connected());
    wait_for_connections(&server, 0).await;
}
