//! Connection pool implementation.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kv_connection::{Connection, ConnectionConfig, ConnectionFactory, KvConnectionFactory};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::lifecycle::{ConnectionState, Membership, ProcessIdSource};
use crate::reaper;

/// Identity of a pooled connection: the address of its shared allocation.
type ConnectionKey = usize;

fn key_of<C>(conn: &Arc<C>) -> ConnectionKey {
    Arc::as_ptr(conn).addr()
}

pub(crate) fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Gate size for a connection limit; unbounded pools get the semaphore maximum.
fn gate_permits(max_connections: Option<u32>) -> usize {
    max_connections.map_or(Semaphore::MAX_PERMITS, |max| {
        usize::try_from(max)
            .unwrap_or(usize::MAX)
            .min(Semaphore::MAX_PERMITS)
    })
}

/// Log and swallow a disconnect failure; teardown is best-effort.
pub(crate) async fn disconnect_quietly<C: Connection>(conn: &C) {
    if let Err(error) = conn.disconnect().await {
        tracing::warn!(%error, "failed to disconnect pooled connection");
    }
}

/// Bookkeeping shared by acquirers, releasers and the idle reaper.
///
/// Invariant: `free` and `in_use` are disjoint and, outside of creations in
/// flight, `free.len() + in_use.len() == created`.
pub(crate) struct PoolState<C> {
    /// Free connections, most recently released last.
    pub(crate) free: Vec<Arc<C>>,
    /// Checked-out connections. Each one owns a forgotten gate permit.
    pub(crate) in_use: HashMap<ConnectionKey, Arc<C>>,
    /// Connections tracked by the pool, including reserved creations.
    pub(crate) created: u32,
    /// Bumped by every hard reset.
    pub(crate) generation: u64,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        Self {
            free: Vec::new(),
            in_use: HashMap::new(),
            created: 0,
            generation: 0,
        }
    }
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    pub(crate) config: PoolConfig,
    pub(crate) factory: F,
    pub(crate) state: Mutex<PoolState<F::Connection>>,
    /// Admission gate with one permit per connection slot.
    gate: Semaphore,
    closed: AtomicBool,
}

/// What an acquirer does once admitted by the gate.
enum Checkout<C> {
    Reuse(Arc<C>),
    Create { generation: u64 },
}

/// A creation slot counted in `created` while the factory runs.
///
/// Dropping an uncommitted reservation gives the slot back, so a failed or
/// cancelled creation is never counted against the ceiling.
struct Reservation<'a, F: ConnectionFactory> {
    pool: &'a PoolInner<F>,
    generation: u64,
    armed: bool,
}

impl<F: ConnectionFactory> Reservation<'_, F> {
    fn commit(mut self, conn: &Arc<F::Connection>, permit: SemaphorePermit<'_>) {
        let mut state = self.pool.state.lock();
        if state.generation != self.generation {
            // A reset zeroed the count after this slot was reserved.
            state.created = state.created.saturating_add(1);
        }
        state.in_use.insert(key_of(conn), Arc::clone(conn));
        self.armed = false;
        drop(state);
        permit.forget();
    }
}

impl<F: ConnectionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state.lock();
            if state.generation == self.generation {
                state.created = state.created.saturating_sub(1);
            }
        }
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn acquire(&self, timeout: Option<Duration>) -> Result<Arc<F::Connection>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        tracing::trace!("acquiring connection from pool");

        let permit = self.admit(timeout).await?;
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let conn = self.checkout(permit).await?;

        // `close` may have drained the pool while the factory was running.
        if self.is_closed() {
            self.untrack(&conn);
            disconnect_quietly(conn.as_ref()).await;
            return Err(PoolError::PoolClosed);
        }

        Ok(conn)
    }

    /// Wait for a gate permit, up to `timeout` from now.
    async fn admit(&self, timeout: Option<Duration>) -> Result<SemaphorePermit<'_>, PoolError> {
        let acquire = self.gate.acquire();
        let permit = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire).await.map_err(|_| {
                tracing::debug!(?timeout, "no connection became available");
                PoolError::AcquisitionTimeout(timeout)
            })?,
            None => acquire.await,
        };
        permit.map_err(|_| PoolError::PoolClosed)
    }

    async fn checkout(
        &self,
        permit: SemaphorePermit<'_>,
    ) -> Result<Arc<F::Connection>, PoolError> {
        let process_id = &self.config.process_id;

        for conn in self.take_stale(process_id) {
            tracing::debug!(
                pid = conn.pid(),
                current_pid = process_id.current(),
                "discarding connection created by another process"
            );
            disconnect_quietly(conn.as_ref()).await;
        }

        let mut late_stale = Vec::new();
        let next = {
            let mut state = self.state.lock();
            let mut reused = None;
            while let Some(conn) = state.free.pop() {
                if process_id.is_stale(conn.pid()) {
                    // Released by a caller after the stale sweep.
                    state.created = state.created.saturating_sub(1);
                    late_stale.push(conn);
                    continue;
                }
                reused = Some(conn);
                break;
            }
            match reused {
                Some(conn) => {
                    state.in_use.insert(key_of(&conn), Arc::clone(&conn));
                    Checkout::Reuse(conn)
                }
                None => {
                    state.created = state.created.saturating_add(1);
                    Checkout::Create {
                        generation: state.generation,
                    }
                }
            }
        };

        for conn in late_stale {
            disconnect_quietly(conn.as_ref()).await;
        }

        let generation = match next {
            Checkout::Reuse(conn) => {
                permit.forget();
                tracing::trace!("reusing free connection");
                return Ok(conn);
            }
            Checkout::Create { generation } => generation,
        };

        let reservation = Reservation {
            pool: self,
            generation,
            armed: true,
        };
        let conn = Arc::new(self.factory.create().await?);
        reservation.commit(&conn, permit);

        tracing::debug!("created new pooled connection");
        Ok(conn)
    }

    /// Remove free connections created by another process.
    fn take_stale(&self, process_id: &ProcessIdSource) -> Vec<Arc<F::Connection>> {
        let mut state = self.state.lock();
        if !state.free.iter().any(|conn| process_id.is_stale(conn.pid())) {
            return Vec::new();
        }
        let (stale, fresh): (Vec<_>, Vec<_>) = state
            .free
            .drain(..)
            .partition(|conn| process_id.is_stale(conn.pid()));
        state.free = fresh;
        state.created = state.created.saturating_sub(count(stale.len()));
        stale
    }

    fn release(&self, conn: &Arc<F::Connection>) {
        let released = {
            let mut state = self.state.lock();
            match state.in_use.remove(&key_of(conn)) {
                Some(conn) => {
                    state.free.push(conn);
                    true
                }
                None => false,
            }
        };

        if released {
            self.gate.add_permits(1);
            tracing::trace!("returned connection to pool");
        } else {
            tracing::debug!("ignoring release of a connection that is not checked out");
        }
    }

    /// Stop tracking a checked-out connection. Returns `false` if it was not
    /// checked out.
    fn untrack(&self, conn: &Arc<F::Connection>) -> bool {
        let mut state = self.state.lock();
        if state.in_use.remove(&key_of(conn)).is_some() {
            state.created = state.created.saturating_sub(1);
            true
        } else {
            false
        }
    }

    fn detach(&self, conn: &Arc<F::Connection>) {
        if self.untrack(conn) {
            self.gate.add_permits(1);
            tracing::trace!("detached connection from pool");
        }
    }

    async fn disconnect_all(&self) {
        let (free, in_use) = {
            let mut state = self.state.lock();
            state.created = 0;
            state.generation = state.generation.wrapping_add(1);
            (
                std::mem::take(&mut state.free),
                std::mem::take(&mut state.in_use),
            )
        };

        // Checked-out connections give their permits back now; releasing
        // them later is a no-op.
        self.gate.add_permits(in_use.len());

        tracing::debug!(
            free = free.len(),
            in_use = in_use.len(),
            "disconnecting all pooled connections"
        );
        for conn in free.iter().chain(in_use.values()) {
            disconnect_quietly(conn.as_ref()).await;
        }
    }

    fn membership(&self, conn: &Arc<F::Connection>) -> Membership {
        let state = self.state.lock();
        if state.in_use.contains_key(&key_of(conn)) {
            Membership::InUse
        } else if state.free.iter().any(|free| Arc::ptr_eq(free, conn)) {
            Membership::Free
        } else {
            Membership::Untracked
        }
    }
}

/// A bounded, blocking pool of key-value connections.
///
/// Connections are built by a [`ConnectionFactory`] on demand, handed out
/// most-recently-released first, and returned with [`release`](Self::release)
/// or by dropping a [`PooledConnection`]. When the pool is at capacity,
/// acquirers wait in FIFO order until a connection is returned or the
/// acquisition timeout expires.
///
/// If both `max_idle_time` and `idle_check_interval` are configured, a
/// background task evicts free connections that have not performed I/O for
/// `max_idle_time`.
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool that builds connections with `factory`.
    ///
    /// Fails if the configuration is invalid, or if idle reaping is configured
    /// and no Tokio runtime is running.
    pub fn new(factory: F, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let permits = gate_permits(config.max_connections);

        let inner = Arc::new(PoolInner {
            config,
            factory,
            state: Mutex::new(PoolState::new()),
            gate: Semaphore::new(permits),
            closed: AtomicBool::new(false),
        });

        let reaper = match inner.config.idle_reaping() {
            Some((max_idle_time, interval)) => {
                let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                    PoolError::Configuration("idle reaping requires a Tokio runtime".into())
                })?;
                Some(reaper::spawn(
                    &runtime,
                    Arc::downgrade(&inner),
                    max_idle_time,
                    interval,
                ))
            }
            None => None,
        };

        tracing::debug!(
            pool = %inner.factory.description(),
            max_connections = ?inner.config.max_connections,
            idle_reaping = reaper.is_some(),
            "connection pool created"
        );

        Ok(Self {
            inner,
            reaper: Mutex::new(reaper),
        })
    }

    /// Start building a pool around `factory`.
    pub fn builder(factory: F) -> PoolBuilder<F> {
        PoolBuilder {
            factory,
            config: PoolConfig::default(),
        }
    }

    /// Get a connection, waiting at most the configured timeout.
    ///
    /// Returns the most recently released free connection if there is one,
    /// otherwise builds a new connection if the pool is below capacity,
    /// otherwise waits until a connection is released.
    pub async fn acquire(&self) -> Result<Arc<F::Connection>, PoolError> {
        self.inner.acquire(self.inner.config.timeout).await
    }

    /// Get a connection, waiting at most `timeout` (without bound if `None`).
    pub async fn acquire_with_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Arc<F::Connection>, PoolError> {
        self.inner.acquire(timeout).await
    }

    /// Get a connection wrapped in a guard that releases it on drop.
    pub async fn get(&self) -> Result<PooledConnection<F>, PoolError> {
        let conn = self.acquire().await?;
        Ok(PooledConnection {
            pool: Arc::clone(&self.inner),
            conn,
            detached: false,
        })
    }

    /// Return a checked-out connection to the pool.
    ///
    /// Releasing a connection that is not checked out (a second release, or a
    /// connection handed out before [`disconnect_all`](Self::disconnect_all))
    /// does nothing.
    pub fn release(&self, conn: &Arc<F::Connection>) {
        self.inner.release(conn);
    }

    /// Disconnect every tracked connection and forget them.
    ///
    /// The pool stays usable; later acquisitions build fresh connections.
    pub async fn disconnect_all(&self) {
        self.inner.disconnect_all().await;
    }

    /// Close the pool, dropping all connections.
    ///
    /// Stops the idle reaper and fails current and future acquisitions with
    /// [`PoolError::PoolClosed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        self.inner.gate.close();
        self.inner.disconnect_all().await;
        tracing::info!("connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Run one idle eviction cycle now and return how many connections were
    /// evicted. Returns 0 if `max_idle_time` is not configured.
    pub async fn evict_idle(&self) -> usize {
        match self.inner.config.max_idle_time {
            Some(max_idle_time) => self.inner.reap_idle(max_idle_time).await,
            None => 0,
        }
    }

    /// Debug description, e.g.
    /// `BlockingConnectionPool<Connection<host=localhost,port=6379,db=1>>`.
    ///
    /// Depends only on the factory's parameters, never on pool state.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("BlockingConnectionPool<{}>", self.inner.factory.description())
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            available: count(state.free.len()),
            in_use: count(state.in_use.len()),
            total: state.created,
            max: self.inner.config.max_connections,
        }
    }

    /// Where `conn` currently sits in the connection lifecycle.
    #[must_use]
    pub fn connection_state(&self, conn: &Arc<F::Connection>) -> ConnectionState {
        ConnectionState::classify(self.inner.membership(conn), conn.is_connected())
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the connection factory.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }
}

impl Pool<KvConnectionFactory> {
    /// Create a socket-backed pool from a URL.
    ///
    /// The URL carries the connection parameters (see
    /// [`ConnectionConfig::from_url`]) and, in its query string, the pool
    /// options read by [`PoolConfig::from_url`].
    pub fn from_url(url: &str) -> Result<Self, PoolError> {
        let connection = ConnectionConfig::from_url(url)
            .map_err(|err| PoolError::Configuration(err.to_string()))?;
        let config = PoolConfig::from_url(url)?;
        Self::new(KvConnectionFactory::new(connection), config)
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl<F: ConnectionFactory> Drop for Pool<F> {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.get_mut().take() {
            reaper.abort();
        }
    }
}

/// Builder for [`Pool`].
pub struct PoolBuilder<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
}

impl<F: ConnectionFactory> PoolBuilder<F> {
    /// Replace the whole pool configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.config = self.config.max_connections(count);
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.timeout(timeout);
        self
    }

    /// Set the maximum idle time of a free connection.
    #[must_use]
    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.config = self.config.max_idle_time(idle);
        self
    }

    /// Set the interval between idle reaper cycles.
    #[must_use]
    pub fn idle_check_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.idle_check_interval(interval);
        self
    }

    /// Set the source of the current process identifier.
    #[must_use]
    pub fn process_id(mut self, source: ProcessIdSource) -> Self {
        self.config = self.config.process_id(source);
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<Pool<F>, PoolError> {
        Pool::new(self.factory, self.config)
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of free connections available.
    pub available: u32,
    /// Number of connections currently checked out.
    pub in_use: u32,
    /// Total number of tracked connections, including ones being created.
    pub total: u32,
    /// Maximum allowed connections (unbounded if `None`).
    pub max: Option<u32>,
}

impl PoolStatus {
    /// Share of the capacity currently checked out, as a percentage.
    ///
    /// Returns `None` for an unbounded pool.
    #[must_use]
    pub fn utilization(&self) -> Option<f64> {
        self.max
            .filter(|&max| max > 0)
            .map(|max| f64::from(self.in_use) / f64::from(max) * 100.0)
    }
}

/// A connection retrieved from the pool.
///
/// When dropped, the connection is automatically returned to the pool.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    conn: Arc<F::Connection>,
    detached: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// The shared connection handle, for identity comparisons.
    #[must_use]
    pub fn connection(&self) -> &Arc<F::Connection> {
        &self.conn
    }

    /// Detach the connection from the pool.
    ///
    /// The pool stops tracking it and frees its slot; the connection will not
    /// be returned to the pool when dropped.
    pub fn detach(mut self) -> Arc<F::Connection> {
        self.pool.detach(&self.conn);
        self.detached = true;
        Arc::clone(&self.conn)
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pid", &self.conn.pid())
            .field("connected", &self.conn.is_connected())
            .field("detached", &self.detached)
            .finish()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if !self.detached {
            self.pool.release(&self.conn);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_utilization() {
        let status = PoolStatus {
            available: 1,
            in_use: 3,
            total: 4,
            max: Some(4),
        };
        assert_eq!(status.utilization(), Some(75.0));

        let unbounded = PoolStatus { max: None, ..status };
        assert!(unbounded.utilization().is_none());
    }

    #[test]
    fn test_connection_key_is_pointer_identity() {
        let a = Arc::new(1u8);
        let b = Arc::new(1u8);
        assert_eq!(key_of(&a), key_of(&Arc::clone(&a)));
        assert_ne!(key_of(&a), key_of(&b));
    }

    #[test]
    fn test_count_saturates() {
        assert_eq!(count(7), 7);
        assert_eq!(count(usize::MAX), u32::MAX);
    }

    #[test]
    fn test_gate_permits_clamped_to_semaphore_max() {
        assert_eq!(gate_permits(Some(4)), 4);
        assert_eq!(gate_permits(None), Semaphore::MAX_PERMITS);
        assert!(gate_permits(Some(u32::MAX)) <= Semaphore::MAX_PERMITS);
    }
}
