//! Checks that the mock server behaves like a real server as far as
//! `KvConnection` can tell.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use kv_connection::{Connection, ConnectionError, KvConnection};
use kv_testing::{MockKvServer, MockReply};

#[tokio::test]
async fn test_request_reply_round_trip() {
    let server = MockKvServer::builder()
        .with_response(
            b"*1\r\n$4\r\nPING\r\n".as_slice(),
            MockReply::data(b"+PONG\r\n".as_slice()),
        )
        .build()
        .await
        .unwrap();

    let conn = KvConnection::new(Arc::new(server.connection_config()));
    let reply = conn.request(b"*1\r\n$4\r\nPING\r\n").await.unwrap();

    assert_eq!(reply.as_ref(), b"+PONG\r\n");
    assert!(conn.is_connected());
    assert!(!conn.is_awaiting_response());
    assert_eq!(server.accepted_count().await, 1);
}

#[tokio::test]
async fn test_silent_server_hits_read_timeout() {
    let server = MockKvServer::builder()
        .with_default_reply(MockReply::Silent)
        .build()
        .await
        .unwrap();

    let config = server
        .connection_config()
        .read_timeout(Duration::from_millis(50));
    let conn = KvConnection::new(Arc::new(config));

    let err = conn.request(b"GET key\r\n").await.unwrap_err();

    assert!(matches!(err, ConnectionError::ReadTimeout));
    assert!(!conn.is_connected());
    assert!(!conn.is_awaiting_response());
}

#[tokio::test]
async fn test_hang_up_reports_closed_connection() {
    let server = MockKvServer::builder()
        .with_default_reply(MockReply::HangUp)
        .build()
        .await
        .unwrap();

    let conn = KvConnection::new(Arc::new(server.connection_config()));
    let err = conn.request(b"GET key\r\n").await.unwrap_err();

    assert!(err.is_transient());
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn test_disconnect_is_seen_by_server() {
    let server = MockKvServer::builder().build().await.unwrap();
    let conn = KvConnection::new(Arc::new(server.connection_config()));

    conn.request(b"PING\r\n").await.unwrap();
    assert_eq!(server.connection_count().await, 1);

    conn.disconnect().await.unwrap();
    wait_for_connections(&server, 0).await;

    // The next request reopens the transport.
    conn.request(b"PING\r\n").await.unwrap();
    assert_eq!(server.accepted_count().await, 2);
}

async fn wait_for_connections(server: &MockKvServer, expected: usize) {
    for _ in 0..100 {
        if server.connection_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.connection_count().await, expected);
}
