//! Connection lifecycle management.
//!
//! This module defines how the pool classifies the connections it hands out,
//! when a free connection counts as idle for too long, and how the pool learns
//! the identity of the current process for fork detection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Lifecycle state of a connection as seen by the pool.
///
/// ```text
/// Unconnected -> InUse -> Idle <-> InUse
///                          |
///                          v
///                    Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Tracked by the pool, but the transport is not open.
    Unconnected,
    /// Connected and checked out by a caller.
    InUse,
    /// Connected and waiting in the free set.
    Idle,
    /// No longer tracked by the pool (evicted, reset or detached).
    Disconnected,
}

/// Where a connection sits in the pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    InUse,
    Free,
    Untracked,
}

impl ConnectionState {
    pub(crate) fn classify(membership: Membership, connected: bool) -> Self {
        match (membership, connected) {
            (Membership::Untracked, _) => Self::Disconnected,
            (_, false) => Self::Unconnected,
            (Membership::InUse, true) => Self::InUse,
            (Membership::Free, true) => Self::Idle,
        }
    }

    /// Check if the connection is available for checkout.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Check if the pool no longer tracks the connection.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// Check if a free connection has been idle for at least `max_idle_time`.
#[must_use]
pub fn is_idle_expired(last_active_at: Instant, now: Instant, max_idle_time: Duration) -> bool {
    now.saturating_duration_since(last_active_at) >= max_idle_time
}

/// Source of the current process identifier.
///
/// Connections remember the process that created them; the pool compares
/// that against this source before handing out a reused connection. The
/// default reads [`std::process::id`]. Environments without `fork` can supply
/// a constant, and tests can simulate a fork by changing the returned value.
#[derive(Clone)]
pub struct ProcessIdSource(Arc<dyn Fn() -> u32 + Send + Sync>);

impl ProcessIdSource {
    /// Use a custom function as the process identifier source.
    pub fn new(source: impl Fn() -> u32 + Send + Sync + 'static) -> Self {
        Self(Arc::new(source))
    }

    /// Identifier of the current process.
    #[must_use]
    pub fn current(&self) -> u32 {
        (self.0)()
    }

    /// Check if a connection created by `pid` belongs to another process.
    #[must_use]
    pub fn is_stale(&self, pid: u32) -> bool {
        pid != self.current()
    }
}

impl Default for ProcessIdSource {
    fn default() -> Self {
        Self::new(std::process::id)
    }
}

impl fmt::Debug for ProcessIdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProcessIdSource")
            .field(&self.current())
            .finish()
    }
}
