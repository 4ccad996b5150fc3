//! Connection contract and the tokio socket implementation.
//!
//! The pool only sees connections through [`Connection`]: it needs to know who
//! created a connection (`pid`), when it last performed I/O, whether a reply is
//! outstanding, and how to tear the transport down. Everything else,
//! including the bytes on the wire, belongs to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::{ConnectionConfig, Endpoint};
use crate::error::ConnectionError;

/// Initial capacity of the reply buffer.
const READ_BUFFER_CAPACITY: usize = 4096;

/// A single logical link to the key-value server, as seen by the pool.
///
/// Implementations use interior mutability: the pool shares connections as
/// `Arc<C>` and compares them by pointer identity.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Identifier of the process that created this connection.
    ///
    /// Fixed at construction.
    fn pid(&self) -> u32;

    /// When the connection last performed I/O.
    ///
    /// Acquiring or releasing a connection is not activity.
    fn last_active_at(&self) -> Instant;

    /// Whether a request has been sent and its reply not yet received.
    fn is_awaiting_response(&self) -> bool;

    /// Whether the transport is currently open.
    fn is_connected(&self) -> bool;

    /// Close the transport.
    ///
    /// Must leave `last_active_at` untouched.
    async fn disconnect(&self) -> Result<(), ConnectionError>;
}

/// Capability that builds connections from a fixed set of parameters.
///
/// The parameters are owned by the factory and never change for its
/// lifetime, so every connection of a pool is built identically.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type this factory builds.
    type Connection: Connection;

    /// Build a new connection.
    ///
    /// Errors are propagated to the caller that asked for the connection.
    async fn create(&self) -> Result<Self::Connection, ConnectionError>;

    /// Description of the connections this factory builds, e.g.
    /// `Connection<host=localhost,port=6379,db=0>`.
    fn description(&self) -> String;
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// A TCP or Unix domain socket connection to the key-value server.
///
/// The transport is opened lazily by the first [`request`](Self::request)
/// (or eagerly by [`connect`](Self::connect)) and reopened on the next request
/// after a [`disconnect`](Connection::disconnect).
pub struct KvConnection {
    config: Arc<ConnectionConfig>,
    pid: u32,
    last_active_at: Mutex<Instant>,
    awaiting_response: AtomicBool,
    connected: AtomicBool,
    /// Wakes requests in flight when the connection is disconnected.
    cancel: Notify,
    transport: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
}

impl KvConnection {
    /// Create an unconnected connection for the given parameters.
    #[must_use]
    pub fn new(config: Arc<ConnectionConfig>) -> Self {
        Self {
            config,
            pid: std::process::id(),
            last_active_at: Mutex::new(Instant::now()),
            awaiting_response: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            cancel: Notify::new(),
            transport: tokio::sync::Mutex::new(None),
        }
    }

    /// The parameters this connection was built from.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Description of this connection, e.g. `Connection<host=h,port=p,db=d>`.
    #[must_use]
    pub fn description(&self) -> String {
        self.config.description()
    }

    /// Open the transport if it is not already open.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut transport = self.transport.lock().await;
        if transport.is_none() {
            *transport = Some(self.open().await?);
            self.connected.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Send a request and wait for the first chunk of its reply.
    ///
    /// Bytes are passed through untouched; framing belongs to the caller.
    /// Any transport failure closes the connection, and the next request
    /// reconnects. A concurrent [`disconnect`](Connection::disconnect) aborts
    /// the request with [`ConnectionError::ConnectionClosed`].
    pub async fn request(&self, payload: &[u8]) -> Result<Bytes, ConnectionError> {
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        let mut guard = tokio::select! {
            guard = self.transport.lock() => guard,
            () = &mut cancelled => return Err(ConnectionError::ConnectionClosed),
        };
        if guard.is_none() {
            let transport = tokio::select! {
                opened = self.open() => opened?,
                () = &mut cancelled => return Err(ConnectionError::ConnectionClosed),
            };
            *guard = Some(transport);
            self.connected.store(true, Ordering::Release);
        }
        let Some(transport) = guard.as_mut() else {
            return Err(ConnectionError::ConnectionClosed);
        };

        self.awaiting_response.store(true, Ordering::Release);
        let result = tokio::select! {
            result = exchange(transport.as_mut(), payload, self.config.read_timeout) => result,
            () = &mut cancelled => Err(ConnectionError::ConnectionClosed),
        };
        self.awaiting_response.store(false, Ordering::Release);
        *self.last_active_at.lock() = Instant::now();

        if result.is_err() {
            // The reply stream is out of sync; never reuse it.
            *guard = None;
            self.connected.store(false, Ordering::Release);
        }
        result
    }

    async fn open(&self) -> Result<Box<dyn Transport>, ConnectionError> {
        let connect = open_endpoint(&self.config.endpoint);
        let transport = match self.config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| ConnectionError::ConnectTimeout)??,
            None => connect.await?,
        };
        tracing::debug!(endpoint = %self.config.description(), "connection established");
        Ok(transport)
    }
}

async fn open_endpoint(endpoint: &Endpoint) -> Result<Box<dyn Transport>, ConnectionError> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix { path } => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(ConnectionError::Unsupported(
            "Unix domain sockets are not available on this platform".into(),
        )),
    }
}

async fn exchange(
    transport: &mut dyn Transport,
    payload: &[u8],
    read_timeout: Option<std::time::Duration>,
) -> Result<Bytes, ConnectionError> {
    transport.write_all(payload).await?;
    transport.flush().await?;

    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let read = transport.read_buf(&mut buf);
    let n = match read_timeout {
        Some(timeout) => tokio::time::timeout(timeout, read)
            .await
            .map_err(|_| ConnectionError::ReadTimeout)??,
        None => read.await?,
    };
    if n == 0 {
        return Err(ConnectionError::ConnectionClosed);
    }
    Ok(buf.freeze())
}

#[async_trait]
impl Connection for KvConnection {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn last_active_at(&self) -> Instant {
        *self.last_active_at.lock()
    }

    fn is_awaiting_response(&self) -> bool {
        self.awaiting_response.load(Ordering::Acquire)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        // An in-flight request holds the transport lock until its reply
        // arrives; make it give the lock up.
        self.cancel.notify_waiters();
        let transport = self.transport.lock().await.take();
        self.connected.store(false, Ordering::Release);
        self.awaiting_response.store(false, Ordering::Release);
        if let Some(mut transport) = transport {
            transport.shutdown().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for KvConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvConnection")
            .field("description", &self.config.description())
            .field("pid", &self.pid)
            .field("connected", &self.is_connected())
            .field("awaiting_response", &self.is_awaiting_response())
            .finish()
    }
}

/// Factory building [`KvConnection`]s from one [`ConnectionConfig`].
///
/// Connections are returned unconnected; the transport opens on first use.
#[derive(Debug, Clone)]
pub struct KvConnectionFactory {
    config: Arc<ConnectionConfig>,
}

impl KvConnectionFactory {
    /// Create a factory for the given parameters.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The parameters every connection is built from.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionFactory for KvConnectionFactory {
    type Connection = KvConnection;

    async fn create(&self) -> Result<KvConnection, ConnectionError> {
        Ok(KvConnection::new(Arc::clone(&self.config)))
    }

    fn description(&self) -> String {
        self.config.description()
    }
}
