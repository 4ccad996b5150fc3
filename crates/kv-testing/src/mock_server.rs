//! Mock key-value server for socket-level tests.
//!
//! The server accepts TCP connections on a loopback port and answers every
//! request with a configured reply. It does not parse the wire protocol: a
//! request is whatever arrives in one read, and it is matched byte-for-byte
//! against the configured requests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use kv_testing::mock_server::{MockKvServer, MockReply};
//!
//! #[tokio::test]
//! async fn test_ping() {
//!     let server = MockKvServer::builder()
//!         .with_response(b"*1\r\n$4\r\nPING\r\n".as_slice(), MockReply::data(b"+PONG\r\n".as_slice()))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let url = server.url(0);
//!     // Point a pool at url...
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use kv_connection::ConnectionConfig;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// What the server does with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Write these bytes back.
    Data(Bytes),
    /// Read the request and never answer.
    Silent,
    /// Close the connection without answering.
    HangUp,
}

impl MockReply {
    /// Reply with `bytes`.
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self::Data(bytes.into())
    }

    /// The simple-string `+OK` reply.
    pub fn ok() -> Self {
        Self::Data(Bytes::from_static(b"+OK\r\n"))
    }
}

/// Configuration for the mock server.
#[derive(Debug)]
pub struct MockServerConfig {
    /// Replies for specific requests.
    responses: HashMap<Bytes, MockReply>,
    /// Reply for unmatched requests.
    default_reply: MockReply,
}

/// Builder for [`MockKvServer`].
#[derive(Debug)]
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Create a new builder that answers every request with `+OK`.
    pub fn new() -> Self {
        Self {
            config: MockServerConfig {
                responses: HashMap::new(),
                default_reply: MockReply::ok(),
            },
        }
    }

    /// Add a reply for a specific request.
    pub fn with_response(mut self, request: impl Into<Bytes>, reply: MockReply) -> Self {
        self.config.responses.insert(request.into(), reply);
        self
    }

    /// Set the reply for unmatched requests.
    pub fn with_default_reply(mut self, reply: MockReply) -> Self {
        self.config.default_reply = reply;
        self
    }

    /// Build and start the mock server.
    pub async fn build(self) -> Result<MockKvServer> {
        MockKvServer::start(self.config).await
    }
}

impl Default for MockServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct ConnectionCounts {
    open: usize,
    accepted: usize,
}

/// A mock key-value server listening on `127.0.0.1`.
///
/// The server stops accepting connections when [`stop`](Self::stop) is called
/// or when it is dropped.
#[derive(Debug)]
pub struct MockKvServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    counts: Arc<Mutex<ConnectionCounts>>,
}

impl MockKvServer {
    /// Create a new builder for the mock server.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start the mock server on an available port.
    pub async fn start(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let config = Arc::new(config);
        let counts = Arc::new(Mutex::new(ConnectionCounts::default()));

        let server = Self {
            addr,
            shutdown_tx: shutdown_tx.clone(),
            counts: Arc::clone(&counts),
        };

        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _peer_addr)) => {
                                let config = Arc::clone(&config);
                                let counts = Arc::clone(&counts);
                                tokio::spawn(async move {
                                    {
                                        let mut c = counts.lock().await;
                                        c.open += 1;
                                        c.accepted += 1;
                                    }
                                    if let Err(e) = handle_connection(stream, &config).await {
                                        tracing::debug!("mock connection error: {}", e);
                                    }
                                    counts.lock().await.open -= 1;
                                });
                            }
                            Err(e) => {
                                tracing::error!("accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Ok(server)
    }

    /// Get the server's listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the host string for connection configuration.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Get the port number.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// A `redis://` URL for database `db` on this server.
    pub fn url(&self, db: u32) -> String {
        format!("redis://{}:{}/{db}", self.host(), self.port())
    }

    /// Connection parameters pointing at this server.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::tcp(self.host(), self.port())
    }

    /// Number of client connections currently open.
    pub async fn connection_count(&self) -> usize {
        self.counts.lock().await.open
    }

    /// Number of client connections accepted since start.
    pub async fn accepted_count(&self) -> usize {
        self.counts.lock().await.accepted
    }

    /// Stop the server.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockKvServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_connection(mut stream: TcpStream, config: &MockServerConfig) -> Result<()> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        buf.clear();
        if stream.read_buf(&mut buf).await? == 0 {
            // Client disconnected
            return Ok(());
        }

        let request = buf.split().freeze();
        match find_reply(&request, config) {
            MockReply::Data(bytes) => {
                stream.write_all(bytes).await?;
                stream.flush().await?;
            }
            MockReply::Silent => {}
            MockReply::HangUp => return Ok(()),
        }
    }
}

fn find_reply<'a>(request: &Bytes, config: &'a MockServerConfig) -> &'a MockReply {
    config
        .responses
        .get(request)
        .unwrap_or(&config.default_reply)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockKvServer::builder().build().await.unwrap();

        assert!(server.port() > 0);
        assert_eq!(server.host(), "127.0.0.1");
        assert_eq!(server.url(3), format!("redis://127.0.0.1:{}/3", server.port()));
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_configured_and_default_replies() {
        let server = MockKvServer::builder()
            .with_response(b"PING".as_slice(), MockReply::data(b"+PONG\r\n".as_slice()))
            .build()
            .await
            .unwrap();

        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        let mut reply = [0u8; 16];

        stream.write_all(b"PING").await.unwrap();
        let n = stream.read(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"+PONG\r\n");

        stream.write_all(b"ECHO").await.unwrap();
        let n = stream.read(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"+OK\r\n");
    }

    #[tokio::test]
    async fn test_hang_up_closes_connection() {
        let server = MockKvServer::builder()
            .with_default_reply(MockReply::HangUp)
            .build()
            .await
            .unwrap();

        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream.write_all(b"PING").await.unwrap();

        let mut reply = [0u8; 16];
        assert_eq!(stream.read(&mut reply).await.unwrap(), 0);
        assert_eq!(server.accepted_count().await, 1);
    }

    #[test]
    fn test_find_reply_falls_back_to_default() {
        let config = MockServerBuilder::new()
            .with_response(b"GET a".as_slice(), MockReply::Silent)
            .config;

        assert_eq!(
            find_reply(&Bytes::from_static(b"GET a"), &config),
            &MockReply::Silent
        );
        match find_reply(&Bytes::from_static(b"GET b"), &config) {
            MockReply::Data(bytes) => assert_eq!(bytes.as_ref(), b"+OK\r\n"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
