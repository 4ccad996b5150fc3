//! In-memory connections for pool tests.
//!
//! [`MockFactory`] builds [`MockConnection`]s that never touch a socket. The
//! factory is cheap to clone and every clone shares the same controls, so a
//! test can hand one clone to a pool and keep another to change the reported
//! process id, script creation failures or count creations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kv_connection::{Connection, ConnectionError, ConnectionFactory};
use parking_lot::Mutex;
use tokio::time::Instant;

/// A connection that records what the pool does to it.
///
/// Connections start unconnected. [`touch`](Self::touch) stands in for a
/// request: it opens the "transport" and refreshes `last_active_at`.
pub struct MockConnection {
    id: u64,
    pid: u32,
    params: Arc<BTreeMap<String, String>>,
    last_active_at: Mutex<Instant>,
    awaiting_response: AtomicBool,
    connected: AtomicBool,
    disconnects: AtomicU32,
    factory_disconnects: Arc<AtomicU64>,
    fail_disconnect: bool,
}

impl MockConnection {
    /// Sequence number assigned by the factory, starting at 1.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The parameters the factory was configured with.
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Look up one parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Simulate a completed request.
    pub fn touch(&self) {
        self.connected.store(true, Ordering::Release);
        *self.last_active_at.lock() = Instant::now();
    }

    /// Mark a request as sent and not yet answered.
    pub fn begin_request(&self) {
        self.connected.store(true, Ordering::Release);
        self.awaiting_response.store(true, Ordering::Release);
    }

    /// Complete the request started by [`begin_request`](Self::begin_request).
    pub fn finish_request(&self) {
        self.awaiting_response.store(false, Ordering::Release);
        *self.last_active_at.lock() = Instant::now();
    }

    /// How many times the connection has been disconnected.
    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connection for MockConnection {
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
        self.connected.store(false, Ordering::Release);
        self.awaiting_response.store(false, Ordering::Release);
        self.disconnects.fetch_add(1, Ordering::AcqRel);
        self.factory_disconnects.fetch_add(1, Ordering::AcqRel);
        if self.fail_disconnect {
            return Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock disconnect failure",
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("connected", &self.is_connected())
            .field("disconnects", &self.disconnect_count())
            .finish()
    }
}

struct FactoryControls {
    params: Arc<BTreeMap<String, String>>,
    pid: AtomicU32,
    created: AtomicU64,
    disconnects: Arc<AtomicU64>,
    pending_failures: AtomicU32,
    fail_disconnect: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
}

/// Factory for [`MockConnection`]s.
#[derive(Clone)]
pub struct MockFactory {
    controls: Arc<FactoryControls>,
}

impl MockFactory {
    /// Create a factory reporting the current process id and no parameters.
    pub fn new() -> Self {
        Self::with_params(std::iter::empty::<(String, String)>())
    }

    /// Create a factory whose connections carry `params`.
    pub fn with_params<K, V>(params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let params = params
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        Self {
            controls: Arc::new(FactoryControls {
                params: Arc::new(params),
                pid: AtomicU32::new(std::process::id()),
                created: AtomicU64::new(0),
                disconnects: Arc::new(AtomicU64::new(0)),
                pending_failures: AtomicU32::new(0),
                fail_disconnect: AtomicBool::new(false),
                create_delay: Mutex::new(None),
            }),
        }
    }

    /// Process id stamped on connections created from now on.
    pub fn pid(&self) -> u32 {
        self.controls.pid.load(Ordering::Acquire)
    }

    /// Change the process id stamped on new connections.
    pub fn set_pid(&self, pid: u32) {
        self.controls.pid.store(pid, Ordering::Release);
    }

    /// Make the next `count` creations fail with a refused connection.
    pub fn fail_next(&self, count: u32) {
        self.controls
            .pending_failures
            .store(count, Ordering::Release);
    }

    /// Make every `disconnect` of connections created from now on fail.
    pub fn fail_disconnects(&self, fail: bool) {
        self.controls.fail_disconnect.store(fail, Ordering::Release);
    }

    /// Sleep for `delay` inside every creation.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.controls.create_delay.lock() = delay;
    }

    /// Number of connections successfully created.
    pub fn created_count(&self) -> u64 {
        self.controls.created.load(Ordering::Acquire)
    }

    /// Disconnects across every connection this factory has built, including
    /// ones the test never got hold of.
    pub fn disconnect_count(&self) -> u64 {
        self.controls.disconnects.load(Ordering::Acquire)
    }

    fn take_failure(&self) -> bool {
        self.controls
            .pending_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn create(&self) -> Result<MockConnection, ConnectionError> {
        let delay = *self.controls.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_failure() {
            return Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock connection refused",
            )));
        }

        let id = self.controls.created.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(MockConnection {
            id,
            pid: self.pid(),
            params: Arc::clone(&self.controls.params),
            last_active_at: Mutex::new(Instant::now()),
            awaiting_response: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disconnects: AtomicU32::new(0),
            factory_disconnects: Arc::clone(&self.controls.disconnects),
            fail_disconnect: self.controls.fail_disconnect.load(Ordering::Acquire),
        })
    }

    fn description(&self) -> String {
        let params = self
            .controls
            .params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("MockConnection<{params}>")
    }
}

impl fmt::Debug for MockFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockFactory")
            .field("description", &self.description())
            .field("pid", &self.pid())
            .field("created", &self.created_count())
            .finish()
    }
}
